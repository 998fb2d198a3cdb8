//! End-to-end lifecycle tests: a fake provisioner subprocess plus a mocked
//! cloud API drive `run_full` through its phases and exit paths.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mqlab_cloud::{BaseUrls, CloudClient, StaticCredentials};
use mqlab_config::{InfraConfig, RoleSpec, RolesSpec, StorageSpec};
use mqlab_domain::{Phase, TagMap, TestMatrix, TestVariant, VariantKind, Workload};
use mqlab_orchestrator::{OrchestratorError, Sequencer};
use mqlab_store::ExperimentStore;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("fake-provisioner");
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// A provisioner whose output document names a single worker host.
fn working_provisioner(dir: &Path) -> PathBuf {
    let doc = concat!(
        r#"{"coordinator_hosts":{"value":[]},"storage_hosts":{"value":[]},"#,
        r#""broker_hosts":{"value":[]},"#,
        r#""worker_hosts":{"value":[{"id":"i-0work","private_ip":"10.0.0.9"}]}}"#,
    );
    write_script(
        dir,
        &format!(
            "#!/bin/sh\ncase \"$1\" in\n  output) printf '%s' '{}' ;;\n  *) echo \"provisioner $1 ok\" ;;\nesac\n",
            doc
        ),
    )
}

fn failing_provisioner(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "#!/bin/sh\ncase \"$1\" in\n  init) echo init ok ;;\n  *) echo \"$1 failed\" >&2; exit 1 ;;\nesac\n",
    )
}

fn infra(module_dir: &Path, provisioner: &Path) -> InfraConfig {
    let spec = |t: &str| RoleSpec { count: 1, instance_type: t.into() };
    InfraConfig {
        cluster_name: "perf-lab".into(),
        project: "pulsar-lab".into(),
        region: "us-east-1".into(),
        module_dir: module_dir.to_path_buf(),
        provisioner: Some(provisioner.display().to_string()),
        roles: RolesSpec {
            coordinator: spec("m5.large"),
            storage: spec("i3.2xlarge"),
            broker: spec("m5.4xlarge"),
            worker: spec("c5.2xlarge"),
        },
        storage: StorageSpec { volume_gb: 500, volume_type: "gp3".into() },
        tags: TagMap::new(),
    }
}

fn single_variant_matrix() -> TestMatrix {
    TestMatrix {
        name: "smoke".into(),
        base: Workload::default(),
        variants: vec![TestVariant {
            name: "rate-1k".into(),
            kind: VariantKind::FixedRate,
            target_rate: Some(1000.0),
            overrides: Default::default(),
        }],
        plateau: None,
    }
}

fn sequencer(server: &MockServer, root: &Path, cancel: CancellationToken) -> Sequencer {
    let cloud = CloudClient::with_endpoints(
        "us-east-1",
        BaseUrls {
            ec2: format!("{}/ec2", server.uri()),
            ssm: format!("{}/ssm", server.uri()),
        },
        StaticCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "SECRET".into(),
            session_token: None,
        },
    );
    Sequencer::new(Arc::new(cloud), ExperimentStore::new(root), cancel)
}

// ── Cloud mocks ───────────────────────────────────────────────────────────────

async fn mock_ec2(server: &MockServer, action: &str, body: String) {
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains(format!("Action={}", action)))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mock_network_kinds_empty(server: &MockServer) {
    for (action, root, set) in [
        ("DescribeVolumes", "DescribeVolumesResponse", "volumeSet"),
        ("DescribeSecurityGroups", "DescribeSecurityGroupsResponse", "securityGroupInfo"),
        ("DescribeSubnets", "DescribeSubnetsResponse", "subnetSet"),
        ("DescribeRouteTables", "DescribeRouteTablesResponse", "routeTableSet"),
        ("DescribeInternetGateways", "DescribeInternetGatewaysResponse", "internetGatewaySet"),
        ("DescribeVpcs", "DescribeVpcsResponse", "vpcSet"),
    ] {
        mock_ec2(server, action, format!("<{root}><{set}/></{root}>")).await;
    }
}

fn instances_xml(state: &str) -> String {
    format!(
        r#"<DescribeInstancesResponse><reservationSet><item><instancesSet>
          <item><instanceId>i-0work</instanceId>
            <instanceState><name>{state}</name></instanceState>
            <privateIpAddress>10.0.0.9</privateIpAddress></item>
        </instancesSet></item></reservationSet></DescribeInstancesResponse>"#
    )
}

/// SSM stack where every submitted command succeeds; stdout is the base64
/// of a benchmark result document so downloads decode to something real.
async fn mock_control_plane(server: &MockServer) {
    let result_doc = serde_json::json!({
        "publishRate": [1000.0, 1000.0],
        "aggregatedPublishLatencyAvg": 3.0,
        "aggregatedPublishLatency50pct": 2.5,
        "aggregatedPublishLatency99pct": 10.0,
        "aggregatedPublishLatency999pct": 40.0,
    });
    let stdout = BASE64.encode(serde_json::to_vec(&result_doc).unwrap());

    Mock::given(method("POST"))
        .and(path("/ssm/"))
        .and(header("X-Amz-Target", "AmazonSSM.DescribeInstanceInformation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "InstanceInformationList": [
                { "InstanceId": "i-0work", "PingStatus": "Online" }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ssm/"))
        .and(header("X-Amz-Target", "AmazonSSM.SendCommand"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Command": { "CommandId": "cmd-e2e" }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ssm/"))
        .and(header("X-Amz-Target", "AmazonSSM.GetCommandInvocation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Status": "Success",
            "StandardOutputContent": stdout,
            "StandardErrorContent": "",
            "ResponseCode": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ssm/"))
        .and(header("X-Amz-Target", "AmazonSSM.CancelCommand"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_runs_all_phases_and_reclaims() {
    let server = MockServer::start().await;
    let dirs = tempfile::tempdir().unwrap();

    // Stage 1 sees the worker running; every later describe (the reclaim
    // sweep) sees it terminated, so the tag scope reads as empty.
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=DescribeInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_string(instances_xml("running")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mock_ec2(&server, "DescribeInstances", instances_xml("terminated")).await;
    mock_network_kinds_empty(&server).await;
    mock_control_plane(&server).await;

    let provisioner = working_provisioner(dirs.path());
    let infra = infra(dirs.path(), &provisioner);
    let mut seq = sequencer(&server, dirs.path(), CancellationToken::new());

    let id = seq
        .run_full(&infra, &single_variant_matrix(), &TagMap::new(), None)
        .await
        .expect("full lifecycle should pass");
    assert_eq!(seq.phase(), Phase::Teardown, "clean run ends in teardown");

    // Artefacts: raw + parsed + sampler series + aggregate report.
    let exp_dir = dirs.path().join(id.as_str());
    let variant_dir = exp_dir.join("benchmark_results/rate-1k");
    assert!(variant_dir.join("raw.json").is_file());
    assert!(variant_dir.join("summary.json").is_file());
    assert!(!variant_dir.join("error.json").exists());
    assert!(exp_dir.join("metrics/rate-1k/metrics.json").is_file());
    assert!(exp_dir.join("benchmark_results/summary.json").is_file());
    assert!(exp_dir.join("infra_vars.json").is_file());
    assert!(exp_dir.join("fleet.json").is_file());

    // The provisioner's streamed lines land in the experiment log.
    let log = std::fs::read_to_string(exp_dir.join("orchestrator.log")).unwrap();
    assert!(log.contains("provisioner apply ok"));
    assert!(log.contains("phase init -> provision"));
    assert!(log.contains("phase report -> teardown"));

    // `latest` follows the experiment from Init onward.
    let store = ExperimentStore::new(dirs.path());
    assert_eq!(store.latest().unwrap().as_ref(), Some(&id));

    // Parsed summary carries the benchmark numbers.
    let summary: serde_json::Value = serde_json::from_slice(
        &std::fs::read(variant_dir.join("summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["outcome"], "passed");
    assert_eq!(summary["summary"]["throughput_msg_s"], 1000.0);
}

#[tokio::test]
async fn provisioner_failure_reclaims_and_reraises() {
    let server = MockServer::start().await;
    let dirs = tempfile::tempdir().unwrap();

    mock_ec2(
        &server,
        "DescribeInstances",
        "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>".into(),
    )
    .await;
    mock_network_kinds_empty(&server).await;

    let provisioner = failing_provisioner(dirs.path());
    let infra = infra(dirs.path(), &provisioner);
    let mut seq = sequencer(&server, dirs.path(), CancellationToken::new());

    let err = seq
        .run_full(&infra, &single_variant_matrix(), &TagMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ProvisionerFailed(_)), "got {err}");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(seq.phase(), Phase::Failed);

    // The experiment directory survives with the causal error on record.
    let store = ExperimentStore::new(dirs.path());
    let id = store.latest().unwrap().expect("latest was set at init");
    let log =
        std::fs::read_to_string(dirs.path().join(id.as_str()).join("orchestrator.log")).unwrap();
    assert!(log.contains("failure in phase provision"));

    // The tag sweep ran even though provisioning never finished.
    let describes = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains("Action=DescribeVpcs"))
        .count();
    assert!(describes > 0, "reclaim sweep must query the tag scope");
}

#[tokio::test]
async fn cancellation_before_provision_still_tears_down() {
    let server = MockServer::start().await;
    let dirs = tempfile::tempdir().unwrap();

    mock_ec2(
        &server,
        "DescribeInstances",
        "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>".into(),
    )
    .await;
    mock_network_kinds_empty(&server).await;

    let provisioner = working_provisioner(dirs.path());
    let infra = infra(dirs.path(), &provisioner);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut seq = sequencer(&server, dirs.path(), cancel);

    let err = seq
        .run_full(&infra, &single_variant_matrix(), &TagMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(seq.phase(), Phase::Failed);

    // Reclaim is never cancellable; the sweep ran regardless.
    let swept = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .any(|r| String::from_utf8_lossy(&r.body).contains("Action=DescribeVpcs"));
    assert!(swept);
}
