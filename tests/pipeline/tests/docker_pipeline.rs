use std::sync::Arc;

use serial_test::serial;
use test_system_worker::runners::{DistInfo, DriverKind, TestEnvironment, driver_for};
use tests_pipeline::{FailingUploader, NullUploader, repositories, worker_config};

fn runner(uploader: Arc<dyn test_system_worker::uploader::ArtifactsUploader>) -> TestEnvironment {
    TestEnvironment::new(
        driver_for(DriverKind::Docker),
        "00000000-0000-4000-8000-000000000000",
        DistInfo::new("almalinux", "8", "x86_64"),
        repositories(),
        worker_config(),
        uploader,
    )
    .expect("runner construction")
}

#[tokio::test]
async fn work_dir_is_scaffolded_and_erased_even_when_publish_fails() {
    let mut runner = runner(Arc::new(FailingUploader));
    runner.prepare_work_dir_files().await.expect("work dir prepared");

    let work_dir = runner.work_dir_path().expect("work dir exists").to_path_buf();
    assert!(work_dir.join("hosts").is_file());
    assert!(work_dir.join("docker.tf").is_file());
    assert!(work_dir.join("versions.tf").is_file());
    assert!(work_dir.join("playbook.yml").is_file());
    assert!(work_dir.join("package_tests/conftest.py").is_file());
    assert!(work_dir.join("artifacts").is_dir());

    // Destroy is guarded and the failing publish must not stop the erase.
    runner.teardown(true).await;
    assert!(!work_dir.exists());
    assert!(runner.work_dir_path().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires docker, terraform and ansible on the host"]
async fn docker_pipeline_end_to_end() {
    let mut runner = runner(Arc::new(NullUploader));

    let setup = runner.setup().await;
    if let Err(error) = &setup {
        runner.teardown(false).await;
        panic!("environment setup: {error}");
    }

    let installed = runner.install_package("zsh", None, None).await;
    runner.teardown(true).await;

    installed.expect("package installed");
    let summary = runner.artifacts().summary();
    assert!(summary["initialize_terraform"].success);
    assert!(summary["start_environment"].success);
    assert!(summary["initial_provision"].success);
    assert!(summary["install_package"].success);
}
