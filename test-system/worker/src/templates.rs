//! Driver-specific rendering of the declarative infrastructure descriptors
//! and the Ansible inventory.

use std::{fs, path::Path};

use serde::Serialize;
use tera::{Context, Tera};
use test_system_shared::constants::X32_ARCHITECTURES;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot compile embedded templates")]
    Compile(#[source] tera::Error),
    #[error("cannot render template {name}")]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },
    #[error("cannot write rendered file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const INVENTORY_TEMPLATE: &str = "hosts";
const DOCKER_MAIN_TEMPLATE: &str = "docker.tf";
const OPENNEBULA_MAIN_TEMPLATE: &str = "opennebula.tf";
const OPENNEBULA_VARS_TEMPLATE: &str = "opennebula.tfvars";

/// Container platform strings per requested architecture.
const ARCH_PLATFORM_MAPPING: [(&str, &str); 10] = [
    ("i386", "linux/386"),
    ("i486", "linux/386"),
    ("i586", "linux/386"),
    ("i686", "linux/386"),
    ("amd64", "linux/amd64"),
    ("x86_64", "linux/amd64"),
    ("arm64", "linux/arm64/v8"),
    ("aarch64", "linux/arm64/v8"),
    ("ppc64le", "linux/ppc64le"),
    ("s390x", "linux/s390x"),
];

#[must_use]
pub fn docker_platform(dist_arch: &str) -> Option<&'static str> {
    ARCH_PLATFORM_MAPPING
        .iter()
        .find(|(arch, _)| *arch == dist_arch)
        .map(|(_, platform)| *platform)
}

#[derive(Serialize)]
pub struct InventoryParams<'a> {
    pub env_name: &'a str,
    pub connection_type: &'a str,
    pub vm_ip: Option<&'a str>,
}

#[derive(Serialize)]
pub struct DockerMainParams<'a> {
    pub container_name: &'a str,
    pub image_name: String,
    pub image_platform: &'a str,
    pub external_network: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

#[derive(Serialize)]
pub struct OpennebulaMainParams<'a> {
    pub vm_name: &'a str,
    pub vm_group: &'a str,
    pub network: Option<&'a str>,
    pub template_regex: String,
    pub ssh_public_key: &'a str,
}

#[derive(Serialize)]
pub struct OpennebulaVarsParams<'a> {
    pub rpc_endpoint: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (INVENTORY_TEMPLATE, include_str!("../resources/hosts.tera")),
            (
                DOCKER_MAIN_TEMPLATE,
                include_str!("../resources/docker/docker.tf.tera"),
            ),
            (
                OPENNEBULA_MAIN_TEMPLATE,
                include_str!("../resources/opennebula/opennebula.tf.tera"),
            ),
            (
                OPENNEBULA_VARS_TEMPLATE,
                include_str!("../resources/opennebula/opennebula.tfvars.tera"),
            ),
        ])
        .map_err(TemplateError::Compile)?;
        Ok(Self { tera })
    }

    fn render_to_file<T: Serialize>(
        &self,
        name: &str,
        params: &T,
        destination: &Path,
    ) -> Result<(), TemplateError> {
        let context = Context::from_serialize(params).map_err(|source| TemplateError::Render {
            name: name.to_owned(),
            source,
        })?;
        let content = self
            .tera
            .render(name, &context)
            .map_err(|source| TemplateError::Render {
                name: name.to_owned(),
                source,
            })?;
        fs::write(destination, content).map_err(|source| TemplateError::Write {
            path: destination.display().to_string(),
            source,
        })
    }

    pub fn render_inventory(
        &self,
        params: &InventoryParams<'_>,
        destination: &Path,
    ) -> Result<(), TemplateError> {
        self.render_to_file(INVENTORY_TEMPLATE, params, destination)
    }

    pub fn render_docker_main(
        &self,
        params: &DockerMainParams<'_>,
        destination: &Path,
    ) -> Result<(), TemplateError> {
        self.render_to_file(DOCKER_MAIN_TEMPLATE, params, destination)
    }

    pub fn render_opennebula_main(
        &self,
        params: &OpennebulaMainParams<'_>,
        destination: &Path,
    ) -> Result<(), TemplateError> {
        self.render_to_file(OPENNEBULA_MAIN_TEMPLATE, params, destination)
    }

    pub fn render_opennebula_vars(
        &self,
        params: &OpennebulaVarsParams<'_>,
        destination: &Path,
    ) -> Result<(), TemplateError> {
        self.render_to_file(OPENNEBULA_VARS_TEMPLATE, params, destination)
    }
}

/// Regex matching eligible VM template names, with every backslash doubled
/// for embedding in the declarative config.
///
/// Shape: `<dist>-<version>-(<arches>).<flavor>.test_system.(<channels>).b<yyyymmdd>-<n>`
/// where `<flavor>` is `base_image` unless a test flavor is given, and
/// `i686` expands to the full 32-bit alternation.
#[must_use]
pub fn opennebula_template_regex(
    dist_name: &str,
    dist_version: &str,
    dist_arch: &str,
    test_flavor: Option<(&str, &str)>,
    allowed_channels: &[String],
) -> String {
    let channels = allowed_channels.join("|");
    let arches = if dist_arch == "i686" {
        X32_ARCHITECTURES.join("|")
    } else {
        dist_arch.to_owned()
    };
    let flavor = match test_flavor {
        Some((name, version)) => format!("{name}-{version}"),
        None => "base_image".to_owned(),
    };
    let regex = format!(
        r"{dist_name}-{dist_version}-({arches})\.{flavor}\.test_system\.({channels})\.b\d{{8}}-\d+"
    );
    regex.replace('\\', r"\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<String> {
        vec!["stable".to_owned(), "beta".to_owned()]
    }

    fn undouble(regex: &str) -> regex::Regex {
        regex::Regex::new(&regex.replace(r"\\", r"\")).unwrap()
    }

    #[test]
    fn inventory_rendering_is_byte_stable() {
        let renderer = TemplateRenderer::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let params = InventoryParams {
            env_name: "docker_00000000-0000-4000-8000-000000000000",
            connection_type: "docker",
            vm_ip: None,
        };

        let first_path = dir.path().join("hosts-a");
        let second_path = dir.path().join("hosts-b");
        renderer.render_inventory(&params, &first_path).unwrap();
        renderer.render_inventory(&params, &second_path).unwrap();

        let first = fs::read(&first_path).unwrap();
        let second = fs::read(&second_path).unwrap();
        assert_eq!(first, second);

        let content = String::from_utf8(first).unwrap();
        assert!(content.starts_with("[docker_00000000-0000-4000-8000-000000000000]\n"));
        assert!(content.contains("ansible_connection=docker"));
        assert!(!content.contains("ansible_user"));
    }

    #[test]
    fn vm_inventory_binds_the_discovered_ip() {
        let renderer = TemplateRenderer::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let params = InventoryParams {
            env_name: "opennebula_task",
            connection_type: "ssh",
            vm_ip: Some("198.51.100.7"),
        };

        let path = dir.path().join("hosts");
        renderer.render_inventory(&params, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("198.51.100.7"));
        assert!(content.contains("ansible_connection=ssh"));
        assert!(content.contains("ansible_user=root"));
    }

    #[test]
    fn docker_main_threads_image_and_proxies() {
        let renderer = TemplateRenderer::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let params = DockerMainParams {
            container_name: "docker_abc",
            image_name: "almalinux:8".to_owned(),
            image_platform: "linux/amd64",
            external_network: Some("lab-net".to_owned()),
            http_proxy: Some("http://proxy:3128".to_owned()),
            https_proxy: None,
            no_proxy: None,
        };

        let path = dir.path().join("docker.tf");
        renderer.render_docker_main(&params, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#"name = "almalinux:8""#));
        assert!(content.contains(r#"platform = "linux/amd64""#));
        assert!(content.contains(r#"name = "lab-net""#));
        assert!(content.contains("http_proxy=http://proxy:3128"));
        assert!(!content.contains("https_proxy="));
    }

    #[test]
    fn platform_mapping_covers_the_published_targets() {
        assert_eq!(docker_platform("x86_64"), Some("linux/amd64"));
        assert_eq!(docker_platform("i586"), Some("linux/386"));
        assert_eq!(docker_platform("aarch64"), Some("linux/arm64/v8"));
        assert_eq!(docker_platform("s390x"), Some("linux/s390x"));
        assert_eq!(docker_platform("riscv64"), None);
    }

    #[test]
    fn template_regex_matches_generated_names() {
        let doubled = opennebula_template_regex("almalinux", "9", "x86_64", None, &channels());
        assert!(doubled.contains(r"\\."));

        let pattern = undouble(&doubled);
        assert!(pattern.is_match("almalinux-9-x86_64.base_image.test_system.stable.b20240101-1"));
        assert!(pattern.is_match("almalinux-9-x86_64.base_image.test_system.beta.b20240115-2"));
        assert!(!pattern.is_match("almalinux-9-aarch64.base_image.test_system.stable.b20240101-1"));
        assert!(!pattern.is_match("almalinux-9-x86_64.base_image.test_system.nightly.b20240101-1"));
        assert!(!pattern.is_match("almalinux-9-x86_64.base_image.test_system.stable.b2024-1"));
    }

    #[test]
    fn i686_expands_to_the_full_32_bit_alternation() {
        let doubled = opennebula_template_regex("almalinux", "9", "i686", None, &channels());
        let pattern = undouble(&doubled);
        for arch in ["i386", "i486", "i586", "i686"] {
            let name = format!("almalinux-9-{arch}.base_image.test_system.stable.b20240101-1");
            assert!(pattern.is_match(&name), "{name} should match");
        }
    }

    #[test]
    fn test_flavor_replaces_the_base_image_segment() {
        let doubled = opennebula_template_regex(
            "almalinux",
            "9",
            "x86_64",
            Some(("gnome", "42")),
            &channels(),
        );
        let pattern = undouble(&doubled);
        assert!(pattern.is_match("almalinux-9-x86_64.gnome-42.test_system.stable.b20240101-1"));
        assert!(!pattern.is_match("almalinux-9-x86_64.base_image.test_system.stable.b20240101-1"));
    }

    #[test]
    fn opennebula_vars_render_provider_credentials() {
        let renderer = TemplateRenderer::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let params = OpennebulaVarsParams {
            rpc_endpoint: "https://one.local:2633/RPC2",
            username: "oneadmin",
            password: "opennebula",
        };

        let path = dir.path().join("opennebula.tfvars");
        renderer.render_opennebula_vars(&params, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#"opennebula_rpc_endpoint = "https://one.local:2633/RPC2""#));
        assert!(content.contains(r#"opennebula_username     = "oneadmin""#));
    }
}
