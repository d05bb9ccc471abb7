//! Static files materialized into every work dir: the Ansible config and
//! playbook, the driver-specific provider pins, and the integrity-tests
//! tree.

use std::{fs, io, path::Path, path::PathBuf};

use tracing::debug;

use crate::runners::DriverKind;

pub const ANSIBLE_CONFIG: &str = "ansible.cfg";
pub const ANSIBLE_PLAYBOOK: &str = "playbook.yml";
pub const ANSIBLE_INVENTORY_FILE: &str = "hosts";
pub const TF_VERSIONS_FILE: &str = "versions.tf";
pub const INTEGRITY_TESTS_DIR: &str = "package_tests";

const ANSIBLE_FILES: [(&str, &str); 2] = [
    (ANSIBLE_CONFIG, include_str!("../resources/ansible.cfg")),
    (ANSIBLE_PLAYBOOK, include_str!("../resources/playbook.yml")),
];

const DOCKER_VERSIONS: &str = include_str!("../resources/docker/versions.tf");
const OPENNEBULA_VERSIONS: &str = include_str!("../resources/opennebula/versions.tf");

const INTEGRITY_TEST_FILES: [(&str, &str); 2] = [
    (
        "conftest.py",
        include_str!("../resources/package_tests/conftest.py"),
    ),
    (
        "tests/test_package_is_correct.py",
        include_str!("../resources/package_tests/tests/test_package_is_correct.py"),
    ),
];

pub fn write_ansible_files(work_dir: &Path) -> io::Result<()> {
    for (name, content) in ANSIBLE_FILES {
        fs::write(work_dir.join(name), content)?;
    }
    Ok(())
}

/// Writes the driver's provider-pin file next to the rendered descriptors.
pub fn write_versions_file(work_dir: &Path, driver: DriverKind) -> io::Result<()> {
    let content = match driver {
        DriverKind::Docker => DOCKER_VERSIONS,
        DriverKind::Opennebula => OPENNEBULA_VERSIONS,
    };
    fs::write(work_dir.join(TF_VERSIONS_FILE), content)
}

/// Materializes the integrity-tests tree and returns its root.
pub fn write_integrity_tests(work_dir: &Path) -> io::Result<PathBuf> {
    let root = work_dir.join(INTEGRITY_TESTS_DIR);
    for (relative, content) in INTEGRITY_TEST_FILES {
        let destination = root.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, content)?;
    }
    debug!(root = %root.display(), "integrity tests materialized");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_dir_scaffolding_is_complete() {
        let work_dir = tempfile::tempdir().unwrap();

        write_ansible_files(work_dir.path()).unwrap();
        write_versions_file(work_dir.path(), DriverKind::Docker).unwrap();
        let tests_root = write_integrity_tests(work_dir.path()).unwrap();

        assert!(work_dir.path().join(ANSIBLE_CONFIG).is_file());
        assert!(work_dir.path().join(ANSIBLE_PLAYBOOK).is_file());
        assert!(work_dir.path().join(TF_VERSIONS_FILE).is_file());
        assert!(tests_root.join("conftest.py").is_file());
        assert!(tests_root.join("tests/test_package_is_correct.py").is_file());
    }

    #[test]
    fn playbook_carries_both_pipeline_tags() {
        let (_, playbook) = ANSIBLE_FILES[1];
        assert!(playbook.contains("initial_provision"));
        assert!(playbook.contains("install_package"));
    }
}
