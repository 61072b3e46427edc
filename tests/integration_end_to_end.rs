//! Full benchmark runs of every kind against the in-memory cloud.

mod common;

use anyhow::Result;
use common::{fast_config, init_test_logging, FakeCloud, Fault, IMAGE_ID, KERNEL, ZONE};
use instance_bench::{
    cli::BenchmarkKind,
    results,
    workloads::{self, WorkloadOptions},
    BenchmarkResults, BenchmarkRunner, BenchmarkSpec, ReportFormat, ResultsManager, RunState,
    RunnerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn short_runtime() -> WorkloadOptions {
    WorkloadOptions {
        runtime: Some(Duration::from_secs(5)),
        ..WorkloadOptions::default()
    }
}

async fn run(
    cloud: &Arc<FakeCloud>,
    spec: BenchmarkSpec,
    config: RunnerConfig,
    manager: Option<&mut ResultsManager>,
) -> Result<BenchmarkResults> {
    run_with(cloud, spec, config, short_runtime(), manager).await
}

async fn run_with(
    cloud: &Arc<FakeCloud>,
    spec: BenchmarkSpec,
    config: RunnerConfig,
    options: WorkloadOptions,
    manager: Option<&mut ResultsManager>,
) -> Result<BenchmarkResults> {
    init_test_logging();
    let workload = workloads::for_kind(spec.kind, &options);
    let mut runner = BenchmarkRunner::new(cloud.clone(), workload, spec, config);
    let results = runner.run(manager, &CancellationToken::new()).await?;
    assert_eq!(runner.state(), RunState::Done);
    Ok(results)
}

fn spec(kind: BenchmarkKind, iterations: usize) -> BenchmarkSpec {
    BenchmarkSpec::new(kind, "m5.large", "noble", iterations).unwrap()
}

#[tokio::test]
async fn boot_report_covers_initial_boot_and_reboot() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let results = run(&cloud, spec(BenchmarkKind::Boot, 2), fast_config(), None).await?;

    let expected = "\
Description,Initial boot and reboot systemd-analyze times
Command,systemd-analyze time

Initial Boot
iteration,firmware,loader,kernel,userspace,total
1,3.802,4.318,5.291,122.026,135.437
2,3.802,4.318,5.291,122.026,135.437

average,3.802,4.318,5.291,122.026,135.437
median,3.802,4.318,5.291,122.026,135.437
std dev,0.000,0.000,0.000,0.000,0.000

Reboot
iteration,firmware,loader,kernel,userspace,total
1,1.500,2.000,3.000,10.000,16.500
2,1.500,2.000,3.000,10.000,16.500

average,1.500,2.000,3.000,10.000,16.500
median,1.500,2.000,3.000,10.000,16.500
std dev,0.000,0.000,0.000,0.000,0.000
";
    assert_eq!(results.rendered, expected);
    assert_eq!(results.image_id, IMAGE_ID);
    assert_eq!(cloud.resolve_calls(), 1);
    assert_eq!(cloud.created().len(), 2);
    // One successful restart per fresh instance.
    assert_eq!(cloud.commands_matching("cat /proc/sys/kernel/random/boot_id"), 2 * 3);
    Ok(())
}

#[tokio::test]
async fn fio_reuses_one_instance_and_renders_json() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let config = RunnerConfig {
        format: ReportFormat::Json,
        ..fast_config()
    };
    let results = run(&cloud, spec(BenchmarkKind::Fio, 3), config, None).await?;

    assert_eq!(cloud.created().len(), 1);
    assert_eq!(cloud.commands_matching("sudo apt-get install --yes fio"), 1);
    assert_eq!(cloud.commands_matching("fio --name=read --readwrite=read"), 3);
    assert_eq!(cloud.commands_matching("fio --name=write --readwrite=write"), 3);
    assert!(cloud
        .commands()
        .iter()
        .any(|c| c.contains("--runtime=5 ")));

    let json: serde_json::Value = serde_json::from_str(&results.rendered)?;
    assert_eq!(
        json["description"],
        "Peak 4K IOPS performance of sequential read and write"
    );
    let series = json["series"].as_array().unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(series[0]["name"], "Read");
    assert_eq!(series[1]["name"], "Write");
    assert_eq!(series[0]["iterations"].as_array().unwrap().len(), 3);
    assert_eq!(series[0]["iterations"][0]["iteration"], 1);
    assert_eq!(series[0]["iterations"][0]["record"]["iops"], 3000.0);
    assert_eq!(series[1]["iterations"][2]["record"]["iops"], 1500.0);
    assert_eq!(series[0]["summary"]["count"], 3);
    Ok(())
}

#[tokio::test]
async fn fio_random_operations_add_two_series() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let options = WorkloadOptions {
        random_io: true,
        ..short_runtime()
    };
    let results = run_with(&cloud, spec(BenchmarkKind::Fio, 2), fast_config(), options, None).await?;

    let names: Vec<_> = results.report.series.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["Read", "Write", "Random Read", "Random Write"]);
    assert_eq!(
        cloud.commands_matching("fio --name=randread --readwrite=randread --size=1G"),
        2
    );
    assert_eq!(cloud.commands_matching("fio --name=randwrite --readwrite=randwrite"), 2);

    let means: Vec<_> = results
        .report
        .summaries
        .iter()
        .map(|s| s.fields[0].mean)
        .collect();
    assert_eq!(means, vec![3000.0, 1500.0, 3000.0, 1500.0]);
    assert!(results
        .rendered
        .starts_with("Description,Peak 4K IOPS performance of sequential and random read and write\n"));
    Ok(())
}

#[tokio::test]
async fn fio_nvme_stripes_free_disks() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new().with_nvme_disks(2));
    let results = run(&cloud, spec(BenchmarkKind::FioNvme, 2), fast_config(), None).await?;

    assert_eq!(cloud.created().len(), 1);
    assert_eq!(cloud.commands_matching("sudo apt-get install --yes fio mdadm"), 1);
    assert_eq!(
        cloud.commands_matching(
            "sudo mdadm --create /dev/md0 --level=0 --name=TEST_RAID --raid-devices=2 /dev/nvme1n1 /dev/nvme2n1"
        ),
        1
    );
    assert_eq!(
        cloud.commands_matching(
            "sudo fio --name=read --readwrite=read --filename=/dev/md0 --numjobs=32 "
        ),
        2
    );
    assert_eq!(cloud.commands_matching("sudo cat fio.json"), 2 * 2);
    assert_eq!(cloud.commands_matching("sudo rm -f fio.json"), 2 * 2);
    assert_eq!(results.report.series[0].len(), 2);
    assert_eq!(results.report.summaries[1].fields[0].mean, 1500.0);
    Ok(())
}

#[tokio::test]
async fn fio_nvme_uses_a_single_disk_directly() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new().with_nvme_disks(1));
    run(&cloud, spec(BenchmarkKind::FioNvme, 1), fast_config(), None).await?;

    assert_eq!(cloud.commands_matching("sudo mdadm"), 0);
    assert_eq!(
        cloud.commands_matching("sudo fio --name=write --readwrite=write --filename=/dev/nvme1n1 "),
        1
    );
    Ok(())
}

#[tokio::test]
async fn netperf_series_follow_test_order() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let results = run(&cloud, spec(BenchmarkKind::Netperf, 1), fast_config(), None).await?;

    let names: Vec<_> = results.report.series.iter().map(|s| s.name()).collect();
    assert_eq!(
        names,
        vec!["TCP send", "UDP send", "TCP receive", "TCP request/response"]
    );
    let means: Vec<_> = results
        .report
        .summaries
        .iter()
        .map(|s| s.fields[0].mean)
        .collect();
    assert_eq!(means, vec![937.45, 9212.76, 811.20, 35934.62]);

    // A single iteration has no spread to report.
    assert!(!results.rendered.contains("std dev"));
    assert!(results.rendered.contains("TCP request/response\niteration,throughput\n1,35934.62\n"));
    Ok(())
}

#[tokio::test]
async fn netperf_measures_against_a_server_in_the_same_zone() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    run(&cloud, spec(BenchmarkKind::Netperf, 2), fast_config(), None).await?;

    assert_eq!(cloud.created(), vec!["i-0001", "i-0002"]);
    let mut destroyed = cloud.destroyed();
    destroyed.sort();
    assert_eq!(destroyed, cloud.created());
    assert!(cloud.live().is_empty());
    assert_eq!(cloud.launch_zones(), vec![None, Some(ZONE.to_string())]);

    let roles: Vec<_> = cloud
        .tags()
        .iter()
        .filter_map(|tags| tags.iter().find(|(key, _)| key == "role").map(|(_, v)| v.clone()))
        .collect();
    assert_eq!(roles, vec!["primary", "server"]);

    // The server only installs netperf and serves.
    let server = cloud.commands_on("i-0002");
    assert!(server.contains(&"sudo apt-get install --yes netperf".to_string()));
    assert!(server.contains(&"sudo netserver".to_string()));
    assert!(!server.iter().any(|c| c.starts_with("sudo netperf ")));

    let primary = cloud.commands_on("i-0001");
    assert!(!primary.contains(&"sudo netserver".to_string()));
    assert_eq!(
        primary
            .iter()
            .filter(|c| *c == "sudo netperf -t TCP_RR -H 172.31.0.2 -l 5 -c -C -n 2")
            .count(),
        2
    );
    assert_eq!(cloud.commands_matching("sudo netperf -t "), 2 * 4);
    Ok(())
}

#[tokio::test]
async fn versions_are_recorded_once_per_run() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let results = run(&cloud, spec(BenchmarkKind::Boot, 2), fast_config(), None).await?;

    let info = results.system_info.expect("versions recorded");
    assert_eq!(info.instance, "i-0001");
    assert_eq!(info.kernel.as_deref(), Some(KERNEL));
    assert_eq!(
        info.package("systemd").and_then(|p| p.version.as_deref()),
        Some("255.4-1ubuntu8")
    );
    assert_eq!(info.package("landscape-client").unwrap().version, None);
    // Two fresh instances, one recording.
    assert_eq!(cloud.commands_matching("uname --kernel-release"), 1);
    assert!(cloud
        .commands_on("i-0002")
        .iter()
        .all(|c| !c.starts_with("dpkg-query ")));
    Ok(())
}

#[tokio::test]
async fn version_recording_can_be_turned_off() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let config = RunnerConfig {
        collect_versions: false,
        ..fast_config()
    };
    let results = run(&cloud, spec(BenchmarkKind::Stress, 1), config, None).await?;

    assert!(results.system_info.is_none());
    assert_eq!(cloud.commands_matching("dpkg-query "), 0);
    assert_eq!(cloud.commands_matching("uname "), 0);
    Ok(())
}

#[tokio::test]
async fn rendering_is_repeatable() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    let results = run(&cloud, spec(BenchmarkKind::Stress, 3), fast_config(), None).await?;

    assert_eq!(results.report.render(ReportFormat::Text)?, results.rendered);
    assert_eq!(
        results.report.render(ReportFormat::Text)?,
        results.report.render(ReportFormat::Text)?
    );
    assert!(results.rendered.contains("\nMatrix\niteration,bogo ops/s (real time)\n"));
    assert!(results.rendered.contains("\naverage,604.59\n"));
    Ok(())
}

#[tokio::test]
async fn eventual_consistency_and_slow_boot_are_absorbed() -> Result<()> {
    let cloud = Arc::new(
        FakeCloud::new()
            .with_not_found_checks(2)
            .with_pending_checks(3),
    );
    let results = run(&cloud, spec(BenchmarkKind::Stress, 1), fast_config(), None).await?;
    assert_eq!(results.report.series[0].len(), 1);
    Ok(())
}

#[tokio::test]
async fn pinned_image_skips_resolution() -> Result<()> {
    // Resolution would fail; a pinned image never asks.
    let cloud = Arc::new(FakeCloud::new().with_fault(Fault::ResolveImage));
    let pinned = spec(BenchmarkKind::Stress, 1).with_image("ami-pinned");
    let results = run(&cloud, pinned, fast_config(), None).await?;

    assert_eq!(results.image_id, "ami-pinned");
    assert_eq!(cloud.resolve_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn created_instances_are_tagged() -> Result<()> {
    let cloud = Arc::new(FakeCloud::new());
    run(&cloud, spec(BenchmarkKind::Stress, 1), fast_config(), None).await?;

    let tags = cloud.tags();
    assert_eq!(tags.len(), 1);
    assert!(tags[0].contains(&("Name".to_string(), "instance-bench".to_string())));
    assert!(tags[0].contains(&("benchmark".to_string(), "stress".to_string())));
    assert!(tags[0].contains(&("role".to_string(), "primary".to_string())));
    Ok(())
}

#[tokio::test]
async fn persisted_captures_can_be_reparsed() -> Result<()> {
    let temp = TempDir::new()?;
    let cloud = Arc::new(FakeCloud::new());
    let spec = spec(BenchmarkKind::Netperf, 2);
    let mut manager = ResultsManager::new(temp.path(), &spec)?;

    let results = run(&cloud, spec, fast_config(), Some(&mut manager)).await?;

    // 4 captures per iteration, then the versions and the report.
    let saved = manager.saved_files();
    assert_eq!(saved.len(), 2 * 4 + 2);
    let info_path = &saved[saved.len() - 2];
    let file_name = info_path.file_name().unwrap().to_str().unwrap();
    assert!(file_name.starts_with("info-netperf-"), "{}", file_name);
    let info: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(info_path)?)?;
    assert_eq!(info["kernel"], KERNEL);

    let report_path = saved.last().unwrap();
    let file_name = report_path.file_name().unwrap().to_str().unwrap();
    assert!(file_name.starts_with("results-netperf-"));
    assert_eq!(std::fs::read_to_string(report_path)?, results.rendered);

    let found = results::discover(temp.path())?;
    assert_eq!(found.len(), 8);
    assert!(found.iter().all(|c| c.record.is_ok()));
    let lines: Vec<_> = found
        .iter()
        .filter_map(|c| c.csv_line(temp.path()))
        .collect();
    assert_eq!(lines.len(), 8);
    assert!(lines
        .iter()
        .all(|l| l.starts_with("m5.large/noble/netperf,netperf-")));
    assert_eq!(lines.iter().filter(|l| l.ends_with(",937.45")).count(), 2);
    Ok(())
}
