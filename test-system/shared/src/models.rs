use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Package repository as supplied by the upstream build system.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Repository {
    #[serde(default)]
    pub name: Option<String>,
    pub baseurl: String,
}

/// Repository with its name filled in, as published to the workers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NormalizedRepository {
    pub name: String,
    pub url: String,
}

/// Fills blank repository names as `repo-<i>`.
#[must_use]
pub fn normalize_repositories(repositories: &[Repository]) -> Vec<NormalizedRepository> {
    let mut counter = 0;
    repositories
        .iter()
        .map(|repository| {
            let name = match &repository.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    let name = format!("repo-{counter}");
                    counter += 1;
                    name
                }
            };
            NormalizedRepository {
                name,
                url: repository.baseurl.clone(),
            }
        })
        .collect()
}

fn default_runner_type() -> String {
    "any".to_owned()
}

/// Test request fetched from the upstream build system.
#[derive(Clone, Debug, Deserialize)]
pub struct TaskRequestPayload {
    #[serde(default = "default_runner_type")]
    pub runner_type: String,
    pub dist_name: String,
    #[serde(deserialize_with = "deserialize_version")]
    pub dist_version: String,
    pub dist_arch: String,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    pub package_name: String,
    #[serde(default)]
    pub package_version: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub module_stream: Option<String>,
    #[serde(default)]
    pub module_version: Option<String>,
    #[serde(default)]
    pub callback_href: Option<String>,
    #[serde(default)]
    pub bs_task_id: Option<i64>,
}

/// Accepts the upstream `dist_version` as either a string or a number.
fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Number(i64),
    }

    Ok(match Version::deserialize(deserializer)? {
        Version::Text(text) => text,
        Version::Number(number) => number.to_string(),
    })
}

/// Message published onto a broker queue for one scheduled task.
///
/// Every field the worker requires stays optional at the serde level so a
/// malformed message can be logged and dropped instead of poisoning the
/// consumer.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TaskMessage {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(default)]
    pub dist_name: Option<String>,
    #[serde(default)]
    pub dist_version: Option<String>,
    #[serde(default)]
    pub dist_arch: Option<String>,
    #[serde(default)]
    pub repositories: Option<Vec<NormalizedRepository>>,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bs_task_id: Option<i64>,
}

impl TaskMessage {
    /// Name of the first required field that is missing, if any.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.task_id.is_none() {
            return Some("task_id");
        }
        if self.runner_type.is_none() {
            return Some("runner_type");
        }
        if self.dist_name.is_none() {
            return Some("dist_name");
        }
        if self.dist_version.is_none() {
            return Some("dist_version");
        }
        if self.dist_arch.is_none() {
            return Some("dist_arch");
        }
        if self.repositories.is_none() {
            return Some("repositories");
        }
        if self.package_name.is_none() {
            return Some("package_name");
        }
        None
    }
}

/// Captured output of one external command.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-stage outcome reported by the task worker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StageOutcome {
    pub success: bool,
}

/// Mapping from stage label to its outcome.
pub type TaskSummary = BTreeMap<String, StageOutcome>;

/// Body of `GET /tasks/{task_id}/result`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskResultResponse {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub api_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repositories_get_generated_names() {
        let repositories = vec![
            Repository {
                name: None,
                baseurl: "http://r1".into(),
            },
            Repository {
                name: Some("extras".into()),
                baseurl: "http://r2".into(),
            },
            Repository {
                name: Some(String::new()),
                baseurl: "http://r3".into(),
            },
        ];

        let normalized = normalize_repositories(&repositories);
        assert_eq!(
            normalized,
            vec![
                NormalizedRepository {
                    name: "repo-0".into(),
                    url: "http://r1".into()
                },
                NormalizedRepository {
                    name: "extras".into(),
                    url: "http://r2".into()
                },
                NormalizedRepository {
                    name: "repo-1".into(),
                    url: "http://r3".into()
                },
            ]
        );
    }

    #[test]
    fn payload_coerces_numeric_dist_version() {
        let payload: TaskRequestPayload = serde_json::from_value(serde_json::json!({
            "dist_name": "almalinux",
            "dist_version": 8,
            "dist_arch": "x86_64",
            "package_name": "zsh",
        }))
        .unwrap();

        assert_eq!(payload.dist_version, "8");
        assert_eq!(payload.runner_type, "any");
        assert!(payload.repositories.is_empty());
    }

    #[test]
    fn task_message_reports_missing_fields() {
        let mut message = TaskMessage {
            task_id: Some("id".into()),
            runner_type: Some("docker".into()),
            dist_name: Some("almalinux".into()),
            dist_version: Some("8".into()),
            dist_arch: Some("x86_64".into()),
            repositories: Some(Vec::new()),
            package_name: Some("zsh".into()),
            ..TaskMessage::default()
        };
        assert_eq!(message.missing_field(), None);

        message.package_name = None;
        assert_eq!(message.missing_field(), Some("package_name"));
    }
}
