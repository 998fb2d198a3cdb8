use mqlab_domain::ExperimentId;
use tracing::{debug, info};

use crate::client::{path_ends_with, texts_of, walk_xml, CloudClient};
use crate::error::CloudError;

const EC2_VERSION: &str = "2016-11-15";

/// One instance as reported by DescribeInstances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    /// Cloud-level lifecycle state: pending, running, shutting-down,
    /// terminated, stopping, stopped.
    pub state: String,
    pub private_ip: Option<String>,
}

/// An internet gateway and the VPCs it is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub id: String,
    pub attached_vpcs: Vec<String>,
}

impl CloudClient {
    fn ec2_params(
        &self,
        action: &str,
        rest: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("Action", action.to_string()),
            ("Version", EC2_VERSION.to_string()),
        ];
        params.extend(rest);
        params
    }

    fn experiment_filter(experiment: &ExperimentId) -> [(&'static str, String); 2] {
        [
            ("Filter.1.Name", "tag:ExperimentID".to_string()),
            ("Filter.1.Value.1", experiment.to_string()),
        ]
    }

    // ── Instances ─────────────────────────────────────────────────────────────

    /// All instances tagged with the experiment id, in any lifecycle state.
    pub async fn describe_instances_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<InstanceInfo>, CloudError> {
        let params =
            self.ec2_params("DescribeInstances", Self::experiment_filter(experiment));
        let xml = self.query_api("ec2", &self.base.ec2, &params).await?;
        Ok(parse_instances(&xml))
    }

    pub async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "EC2: TerminateInstances");
        // Query-protocol list members are numbered from 1.
        let rest: Vec<(&'static str, String)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (instance_id_key(i), id.clone()))
            .collect();
        let params = self.ec2_params("TerminateInstances", rest);
        self.query_api("ec2", &self.base.ec2, &params).await.map(|_| ())
    }

    // ── Tag-scoped enumeration per resource kind ──────────────────────────────

    pub async fn volumes_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        self.ids_by_tag("DescribeVolumes", "volumeId", experiment).await
    }

    pub async fn security_groups_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        self.ids_by_tag("DescribeSecurityGroups", "groupId", experiment).await
    }

    pub async fn subnets_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        self.ids_by_tag("DescribeSubnets", "subnetId", experiment).await
    }

    pub async fn route_tables_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        self.ids_by_tag("DescribeRouteTables", "routeTableId", experiment).await
    }

    pub async fn vpcs_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        self.ids_by_tag("DescribeVpcs", "vpcId", experiment).await
    }

    pub async fn internet_gateways_by_tag(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<GatewayInfo>, CloudError> {
        let params =
            self.ec2_params("DescribeInternetGateways", Self::experiment_filter(experiment));
        let xml = self.query_api("ec2", &self.base.ec2, &params).await?;
        Ok(parse_gateways(&xml))
    }

    async fn ids_by_tag(
        &self,
        action: &'static str,
        id_tag: &str,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        let params = self.ec2_params(action, Self::experiment_filter(experiment));
        let xml = self.query_api("ec2", &self.base.ec2, &params).await?;
        let ids = texts_of(&xml, id_tag);
        debug!(action, count = ids.len(), "tag-scoped enumeration");
        Ok(ids)
    }

    // ── Deletions ─────────────────────────────────────────────────────────────

    pub async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteVolume", "VolumeId", id).await
    }

    pub async fn delete_security_group(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteSecurityGroup", "GroupId", id).await
    }

    pub async fn delete_subnet(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteSubnet", "SubnetId", id).await
    }

    pub async fn delete_route_table(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteRouteTable", "RouteTableId", id).await
    }

    pub async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), CloudError> {
        info!(gateway_id, vpc_id, "EC2: DetachInternetGateway");
        let params = self.ec2_params(
            "DetachInternetGateway",
            [
                ("InternetGatewayId", gateway_id.to_string()),
                ("VpcId", vpc_id.to_string()),
            ],
        );
        self.query_api("ec2", &self.base.ec2, &params).await.map(|_| ())
    }

    pub async fn delete_internet_gateway(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteInternetGateway", "InternetGatewayId", id).await
    }

    pub async fn delete_vpc(&self, id: &str) -> Result<(), CloudError> {
        self.delete_by_id("DeleteVpc", "VpcId", id).await
    }

    async fn delete_by_id(
        &self,
        action: &'static str,
        key: &'static str,
        id: &str,
    ) -> Result<(), CloudError> {
        info!(action, id, "EC2 delete");
        let params = self.ec2_params(action, [(key, id.to_string())]);
        self.query_api("ec2", &self.base.ec2, &params).await.map(|_| ())
    }
}

/// Query-protocol member keys for TerminateInstances (`InstanceId.1` …).
/// Fleets cap out well below this; anything larger is a bug upstream.
fn instance_id_key(index: usize) -> &'static str {
    const KEYS: [&str; 32] = [
        "InstanceId.1", "InstanceId.2", "InstanceId.3", "InstanceId.4",
        "InstanceId.5", "InstanceId.6", "InstanceId.7", "InstanceId.8",
        "InstanceId.9", "InstanceId.10", "InstanceId.11", "InstanceId.12",
        "InstanceId.13", "InstanceId.14", "InstanceId.15", "InstanceId.16",
        "InstanceId.17", "InstanceId.18", "InstanceId.19", "InstanceId.20",
        "InstanceId.21", "InstanceId.22", "InstanceId.23", "InstanceId.24",
        "InstanceId.25", "InstanceId.26", "InstanceId.27", "InstanceId.28",
        "InstanceId.29", "InstanceId.30", "InstanceId.31", "InstanceId.32",
    ];
    KEYS[index.min(KEYS.len() - 1)]
}

/// Read a DescribeInstances response: one record per `instancesSet/item`.
/// Path-suffix matching keeps nested structures (network interfaces also
/// carry a privateIpAddress) out of the results.
fn parse_instances(xml: &str) -> Vec<InstanceInfo> {
    let mut out: Vec<InstanceInfo> = Vec::new();
    walk_xml(xml, |path, text| {
        if path_ends_with(path, &["instancesSet", "item", "instanceId"]) {
            out.push(InstanceInfo {
                id: text.to_string(),
                state: String::new(),
                private_ip: None,
            });
        } else if path_ends_with(path, &["item", "instanceState", "name"]) {
            if let Some(instance) = out.last_mut() {
                instance.state = text.to_string();
            }
        } else if path_ends_with(path, &["instancesSet", "item", "privateIpAddress"]) {
            if let Some(instance) = out.last_mut() {
                instance.private_ip = Some(text.to_string());
            }
        }
    });
    out
}

/// Read a DescribeInternetGateways response: each gateway id followed by
/// the vpcIds of its attachments.
fn parse_gateways(xml: &str) -> Vec<GatewayInfo> {
    let mut out: Vec<GatewayInfo> = Vec::new();
    walk_xml(xml, |path, text| {
        if path_ends_with(path, &["item", "internetGatewayId"]) {
            out.push(GatewayInfo {
                id: text.to_string(),
                attached_vpcs: Vec::new(),
            });
        } else if path_ends_with(path, &["attachmentSet", "item", "vpcId"]) {
            if let Some(gateway) = out.last_mut() {
                gateway.attached_vpcs.push(text.to_string());
            }
        }
    });
    out
}
