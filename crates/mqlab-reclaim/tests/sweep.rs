//! Full-sweep reclaim tests against a mocked cloud API.

use std::sync::Arc;

use mqlab_cloud::{BaseUrls, CloudClient, StaticCredentials};
use mqlab_domain::ExperimentId;
use mqlab_reclaim::Reclaimer;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn reclaimer(server: &MockServer) -> Reclaimer {
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
    Reclaimer::new(Arc::new(cloud))
}

fn experiment() -> ExperimentId {
    ExperimentId::parse("exp-20260801-120000").unwrap()
}

async fn mock_action(server: &MockServer, action: &str, body: &str) {
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains(format!("Action={}", action)))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .mount(server)
        .await;
}

fn empty_set(root: &str, set: &str) -> String {
    format!("<{root}><{set}/></{root}>")
}

async fn mock_empty_network_kinds(server: &MockServer) {
    mock_action(server, "DescribeVolumes", &empty_set("DescribeVolumesResponse", "volumeSet")).await;
    mock_action(
        server,
        "DescribeSecurityGroups",
        &empty_set("DescribeSecurityGroupsResponse", "securityGroupInfo"),
    )
    .await;
    mock_action(server, "DescribeSubnets", &empty_set("DescribeSubnetsResponse", "subnetSet")).await;
    mock_action(
        server,
        "DescribeRouteTables",
        &empty_set("DescribeRouteTablesResponse", "routeTableSet"),
    )
    .await;
    mock_action(
        server,
        "DescribeInternetGateways",
        &empty_set("DescribeInternetGatewaysResponse", "internetGatewaySet"),
    )
    .await;
    mock_action(server, "DescribeVpcs", &empty_set("DescribeVpcsResponse", "vpcSet")).await;
}

fn instances_xml(state: &str) -> String {
    format!(
        r#"<DescribeInstancesResponse><reservationSet><item><instancesSet>
          <item><instanceId>i-0aaa</instanceId>
            <instanceState><name>{state}</name></instanceState></item>
        </instancesSet></item></reservationSet></DescribeInstancesResponse>"#
    )
}

#[tokio::test]
async fn sweep_terminates_and_deletes_in_order() {
    let server = MockServer::start().await;

    // Discovery sees a running instance; after termination is requested the
    // next describe reports it terminated, releasing the wait barrier.
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=DescribeInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_string(instances_xml("running")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=DescribeInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_string(instances_xml("terminated")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=TerminateInstances"))
        .and(body_string_contains("InstanceId.1=i-0aaa"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<ok/>"))
        .expect(1)
        .mount(&server)
        .await;

    // One volume and one VPC-attached gateway; everything else empty.
    mock_action(
        &server,
        "DescribeVolumes",
        "<DescribeVolumesResponse><volumeSet><item><volumeId>vol-111</volumeId></item></volumeSet></DescribeVolumesResponse>",
    )
    .await;
    mock_action(
        &server,
        "DescribeSecurityGroups",
        &empty_set("DescribeSecurityGroupsResponse", "securityGroupInfo"),
    )
    .await;
    mock_action(&server, "DescribeSubnets", &empty_set("DescribeSubnetsResponse", "subnetSet")).await;
    mock_action(
        &server,
        "DescribeRouteTables",
        &empty_set("DescribeRouteTablesResponse", "routeTableSet"),
    )
    .await;
    mock_action(
        &server,
        "DescribeInternetGateways",
        r#"<DescribeInternetGatewaysResponse><internetGatewaySet><item>
            <internetGatewayId>igw-111</internetGatewayId>
            <attachmentSet><item><vpcId>vpc-111</vpcId></item></attachmentSet>
          </item></internetGatewaySet></DescribeInternetGatewaysResponse>"#,
    )
    .await;
    mock_action(
        &server,
        "DescribeVpcs",
        "<DescribeVpcsResponse><vpcSet><item><vpcId>vpc-111</vpcId></item></vpcSet></DescribeVpcsResponse>",
    )
    .await;

    for action in [
        "DeleteVolume",
        "DetachInternetGateway",
        "DeleteInternetGateway",
        "DeleteVpc",
    ] {
        Mock::given(method("POST"))
            .and(path("/ec2/"))
            .and(body_string_contains(format!("Action={action}")))
            .respond_with(ResponseTemplate::new(200).set_body_string("<ok/>"))
            .expect(1)
            .mount(&server)
            .await;
    }

    let report = reclaimer(&server).reclaim(&experiment(), None).await.unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);
    // instance + volume + gateway + vpc
    assert_eq!(report.destroyed, 4);
}

#[tokio::test]
async fn sweep_on_empty_scope_is_clean_noop() {
    let server = MockServer::start().await;
    mock_action(
        &server,
        "DescribeInstances",
        "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>",
    )
    .await;
    mock_empty_network_kinds(&server).await;

    let report = reclaimer(&server).reclaim(&experiment(), None).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.destroyed, 0);
}

#[tokio::test]
async fn not_found_deletions_count_as_success() {
    let server = MockServer::start().await;
    mock_action(
        &server,
        "DescribeInstances",
        "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>",
    )
    .await;
    mock_action(
        &server,
        "DescribeVolumes",
        "<DescribeVolumesResponse><volumeSet><item><volumeId>vol-gone</volumeId></item></volumeSet></DescribeVolumesResponse>",
    )
    .await;
    mock_action(
        &server,
        "DescribeSecurityGroups",
        &empty_set("DescribeSecurityGroupsResponse", "securityGroupInfo"),
    )
    .await;
    mock_action(&server, "DescribeSubnets", &empty_set("DescribeSubnetsResponse", "subnetSet")).await;
    mock_action(
        &server,
        "DescribeRouteTables",
        &empty_set("DescribeRouteTablesResponse", "routeTableSet"),
    )
    .await;
    mock_action(
        &server,
        "DescribeInternetGateways",
        &empty_set("DescribeInternetGatewaysResponse", "internetGatewaySet"),
    )
    .await;
    mock_action(&server, "DescribeVpcs", &empty_set("DescribeVpcsResponse", "vpcSet")).await;

    // The volume is already gone by the time deletion is requested.
    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=DeleteVolume"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InvalidVolume.NotFound</Code><Message>gone</Message></Error></Errors></Response>",
        ))
        .mount(&server)
        .await;

    let report = reclaimer(&server).reclaim(&experiment(), None).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.destroyed, 1);
}

#[tokio::test]
async fn dry_run_plan_has_no_side_effects() {
    let server = MockServer::start().await;
    mock_action(&server, "DescribeInstances", &instances_xml("running")).await;
    mock_empty_network_kinds(&server).await;

    let plan = reclaimer(&server).plan(&experiment()).await.unwrap();
    assert_eq!(plan.instances, vec!["i-0aaa".to_string()]);
    assert_eq!(plan.total(), 1);

    // Only describe calls were issued.
    let requests = server.received_requests().await.unwrap();
    for request in requests {
        let body = String::from_utf8_lossy(&request.body).into_owned();
        assert!(body.contains("Action=Describe"), "unexpected mutation: {body}");
    }
}

#[tokio::test]
async fn deletion_failure_marks_report_dirty() {
    let server = MockServer::start().await;
    mock_action(
        &server,
        "DescribeInstances",
        "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>",
    )
    .await;
    mock_action(
        &server,
        "DescribeVolumes",
        "<DescribeVolumesResponse><volumeSet><item><volumeId>vol-stuck</volumeId></item></volumeSet></DescribeVolumesResponse>",
    )
    .await;
    mock_action(
        &server,
        "DescribeSecurityGroups",
        &empty_set("DescribeSecurityGroupsResponse", "securityGroupInfo"),
    )
    .await;
    mock_action(&server, "DescribeSubnets", &empty_set("DescribeSubnetsResponse", "subnetSet")).await;
    mock_action(
        &server,
        "DescribeRouteTables",
        &empty_set("DescribeRouteTablesResponse", "routeTableSet"),
    )
    .await;
    mock_action(
        &server,
        "DescribeInternetGateways",
        &empty_set("DescribeInternetGatewaysResponse", "internetGatewaySet"),
    )
    .await;
    mock_action(&server, "DescribeVpcs", &empty_set("DescribeVpcsResponse", "vpcSet")).await;

    Mock::given(method("POST"))
        .and(path("/ec2/"))
        .and(body_string_contains("Action=DeleteVolume"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>VolumeInUse</Code><Message>attached</Message></Error></Errors></Response>",
        ))
        .mount(&server)
        .await;

    let report = reclaimer(&server).reclaim(&experiment(), None).await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.errors.len(), 1);
}
