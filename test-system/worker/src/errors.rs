use test_system_shared::errors::DynError;
use thiserror::Error;

/// Artifact publication failures.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("cannot build the artifact storage client")]
    Build(#[source] object_store::Error),
    #[error("cannot list artifacts in {dir}")]
    List {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write log file {file}")]
    WriteLog {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read artifact {file}")]
    ReadFile {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot upload artifact {file}")]
    Upload {
        file: String,
        #[source]
        source: object_store::Error,
    },
}

/// Faults raised by the environment runner pipeline. Every variant aborts
/// the current task; none of them may poison the worker.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("cannot create working directory and needed files")]
    WorkDirPreparation(#[source] DynError),
    #[error("cannot initialize terraform")]
    TerraformInitialization,
    #[error("cannot start environment: {reason}")]
    StartEnvironment { reason: String },
    #[error("cannot provision environment: {reason}")]
    Provision { reason: String },
    #[error("cannot install package")]
    InstallPackage,
    #[error("package integrity tests failed")]
    PackageIntegrityTests,
    #[error("cannot publish artifacts")]
    PublishArtifacts(#[source] UploadError),
    #[error("cannot destroy environment")]
    StopEnvironment,
    #[error("cannot find a VM image with the parameters: {params}")]
    VmImageNotFound { params: String },
    #[error("unknown distribution: {0}")]
    UnknownDistribution(String),
}
