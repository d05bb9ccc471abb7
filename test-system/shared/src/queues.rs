//! Queue naming policy and architecture equivalence classes.

use crate::constants::{ARCHITECTURES, COSTS, DRIVERS};

pub const DEFAULT_QUEUE_NAME: &str = "default";

const AARCH64_CLASS: [&str; 2] = ["arm64", "aarch64"];
const X86_64_CLASS: [&str; 6] = ["x86_64", "amd64", "i386", "i486", "i586", "i686"];
const PPC64LE_CLASS: [&str; 1] = ["ppc64le"];
const S390X_CLASS: [&str; 1] = ["s390x"];

/// Class representative paired with the requested arches it accepts.
pub type ArchClass = (&'static str, &'static [&'static str]);

/// Equivalence classes covering every supported architecture.
pub const FULL_ARCHITECTURES_MAPPING: [ArchClass; 4] = [
    ("aarch64", &AARCH64_CLASS),
    ("x86_64", &X86_64_CLASS),
    ("ppc64le", &PPC64LE_CLASS),
    ("s390x", &S390X_CLASS),
];

/// Container images are only published for these classes.
pub const CONTAINER_ARCHITECTURES_MAPPING: [ArchClass; 2] = [
    ("aarch64", &AARCH64_CLASS),
    ("x86_64", &X86_64_CLASS),
];

/// Class representative for `dist_arch` within `mapping`, if any.
#[must_use]
pub fn queue_arch(mapping: &[ArchClass], dist_arch: &str) -> Option<&'static str> {
    mapping
        .iter()
        .find(|(_, members)| members.contains(&dist_arch))
        .map(|(representative, _)| *representative)
}

/// Queue and routing-key name: `<driver>-<arch>-<cost>`.
#[must_use]
pub fn queue_name(driver: &str, queue_arch: &str, cost: u8) -> String {
    format!("{driver}-{queue_arch}-{cost}")
}

/// The complete queue set: {drivers} x {architectures} x {costs} plus the
/// sentinel default queue.
#[must_use]
pub fn all_queue_names() -> Vec<String> {
    let mut names = vec![DEFAULT_QUEUE_NAME.to_owned()];
    for driver in DRIVERS {
        for arch in ARCHITECTURES {
            for cost in COSTS {
                names.push(queue_name(driver, arch, cost));
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_partition_supported_arches() {
        for (_, members) in FULL_ARCHITECTURES_MAPPING {
            for member in members {
                let owners = FULL_ARCHITECTURES_MAPPING
                    .iter()
                    .filter(|(_, candidates)| candidates.contains(member))
                    .count();
                assert_eq!(owners, 1, "{member} must belong to exactly one class");
            }
        }
    }

    #[test]
    fn thirty_two_bit_arches_collapse_to_x86_64() {
        for arch in ["i386", "i486", "i586", "i686", "amd64", "x86_64"] {
            assert_eq!(queue_arch(&FULL_ARCHITECTURES_MAPPING, arch), Some("x86_64"));
        }
        assert_eq!(queue_arch(&FULL_ARCHITECTURES_MAPPING, "arm64"), Some("aarch64"));
        assert_eq!(queue_arch(&FULL_ARCHITECTURES_MAPPING, "riscv64"), None);
    }

    #[test]
    fn container_mapping_rejects_mainframe_arches() {
        assert_eq!(queue_arch(&CONTAINER_ARCHITECTURES_MAPPING, "s390x"), None);
        assert_eq!(queue_arch(&CONTAINER_ARCHITECTURES_MAPPING, "ppc64le"), None);
        assert_eq!(
            queue_arch(&CONTAINER_ARCHITECTURES_MAPPING, "i686"),
            Some("x86_64")
        );
    }

    #[test]
    fn queue_names_follow_the_routing_pattern() {
        let pattern = regex_lite();
        for name in all_queue_names() {
            if name == DEFAULT_QUEUE_NAME {
                continue;
            }
            assert!(pattern(&name), "unexpected queue name {name}");
        }
        // drivers x architectures x costs, plus the default queue
        assert_eq!(all_queue_names().len(), 2 * 4 * 5 + 1);
    }

    // Enough of ^(docker|opennebula)-(aarch64|x86_64|ppc64le|s390x)-[0-4]$
    // without pulling the regex crate into this crate.
    fn regex_lite() -> impl Fn(&str) -> bool {
        |name: &str| {
            let mut parts = name.rsplitn(2, '-');
            let cost = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            let cost_ok = matches!(cost, "0" | "1" | "2" | "3" | "4");
            let arch_ok = ARCHITECTURES.iter().any(|arch| {
                rest.ends_with(arch)
                    && DRIVERS
                        .iter()
                        .any(|driver| rest == format!("{driver}-{arch}"))
            });
            cost_ok && arch_ok
        }
    }
}
