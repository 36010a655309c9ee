use async_trait::async_trait;
use aws_sdk_ec2::types::{
    DefaultTargetCapacityType, Filter, FleetLaunchTemplateConfigRequest,
    FleetLaunchTemplateOverridesRequest, FleetLaunchTemplateSpecificationRequest, FleetType,
    InstanceType, ResourceType, SpotAllocationStrategy, SpotOptionsRequest, Tag, TagSpecification,
    TargetCapacitySpecificationRequest,
};
use tracing::debug;

use capstan_types::{
    tags, CapacityType, FleetResult, FleetSpec, InstanceFilter, RunnerInstance, RunnerKind,
};

use crate::ports::FleetOps;

/// EC2-backed inventory and fleet operations.
#[derive(Clone)]
pub struct Ec2Fleet {
    client: aws_sdk_ec2::Client,
}

impl Ec2Fleet {
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FleetOps for Ec2Fleet {
    async fn list_runners(&self, filter: &InstanceFilter) -> anyhow::Result<Vec<RunnerInstance>> {
        let mut filters = vec![
            Filter::builder()
                .name(format!("tag:{}", tags::APPLICATION))
                .values(tags::APPLICATION_VALUE)
                .build(),
            Filter::builder()
                .name(format!("tag:{}", tags::ENVIRONMENT))
                .values(&filter.environment)
                .build(),
        ];
        if !filter.states.is_empty() {
            let mut state_filter = Filter::builder().name("instance-state-name");
            for state in &filter.states {
                state_filter = state_filter.values(state.as_filter());
            }
            filters.push(state_filter.build());
        }
        if let Some(owner) = &filter.owner {
            filters.push(
                Filter::builder()
                    .name(format!("tag:{}", tags::OWNER))
                    .values(owner)
                    .build(),
            );
        }
        if filter.orphan {
            filters.push(
                Filter::builder()
                    .name(format!("tag:{}", tags::ORPHAN))
                    .values("true")
                    .build(),
            );
        }

        let mut pages = self
            .client
            .describe_instances()
            .set_filters(Some(filters))
            .into_paginator()
            .send();
        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    if let Some(record) = parse_instance(instance) {
                        instances.push(record);
                    }
                }
            }
        }
        debug!(count = instances.len(), environment = %filter.environment, "listed managed instances");
        Ok(instances)
    }

    async fn create_fleet(&self, spec: &FleetSpec) -> anyhow::Result<FleetResult> {
        let template = FleetLaunchTemplateSpecificationRequest::builder()
            .launch_template_name(&spec.launch_template)
            .version("$Default")
            .build();

        let mut overrides = Vec::new();
        for subnet in &spec.subnets {
            for instance_type in &spec.instance_types {
                let mut override_builder = FleetLaunchTemplateOverridesRequest::builder()
                    .subnet_id(subnet)
                    .instance_type(InstanceType::from(instance_type.as_str()));
                if let Some(ami) = &spec.ami_id {
                    override_builder = override_builder.image_id(ami);
                }
                overrides.push(override_builder.build());
            }
        }

        let launch_config = FleetLaunchTemplateConfigRequest::builder()
            .launch_template_specification(template)
            .set_overrides(Some(overrides))
            .build();

        let instance_tags: Vec<Tag> = spec
            .instance_tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(instance_tags.clone()))
            .build();
        let volume_tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Volume)
            .set_tags(Some(instance_tags))
            .build();

        let capacity_type = match spec.capacity_type {
            CapacityType::Spot => DefaultTargetCapacityType::Spot,
            CapacityType::OnDemand => DefaultTargetCapacityType::OnDemand,
        };
        let target = TargetCapacitySpecificationRequest::builder()
            .total_target_capacity(spec.count as i32)
            .default_target_capacity_type(capacity_type)
            .build();

        let mut request = self
            .client
            .create_fleet()
            .r#type(FleetType::Instant)
            .launch_template_configs(launch_config)
            .target_capacity_specification(target)
            .tag_specifications(tag_spec)
            .tag_specifications(volume_tag_spec);
        if spec.capacity_type == CapacityType::Spot {
            request = request.spot_options(
                SpotOptionsRequest::builder()
                    .allocation_strategy(SpotAllocationStrategy::from(
                        spec.allocation_strategy.as_str(),
                    ))
                    .set_max_total_price(spec.max_spot_price.clone())
                    .build(),
            );
        }

        let output = request.send().await?;
        let instance_ids: Vec<String> = output
            .instances()
            .iter()
            .flat_map(|fleet_instance| fleet_instance.instance_ids().iter().cloned())
            .collect();
        let error_codes: Vec<String> = output
            .errors()
            .iter()
            .filter_map(|e| e.error_code().map(str::to_string))
            .collect();
        debug!(
            requested = spec.count,
            created = instance_ids.len(),
            errors = ?error_codes,
            "create-fleet finished"
        );
        Ok(FleetResult {
            instance_ids,
            error_codes,
        })
    }

    async fn terminate(&self, instance_id: &str) -> anyhow::Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await?;
        Ok(())
    }

    async fn tag(&self, instance_id: &str, tag_list: &[(String, String)]) -> anyhow::Result<()> {
        let mut request = self.client.create_tags().resources(instance_id);
        for (key, value) in tag_list {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }
        request.send().await?;
        Ok(())
    }

    async fn untag(&self, instance_id: &str, tag_list: &[(String, String)]) -> anyhow::Result<()> {
        let mut request = self.client.delete_tags().resources(instance_id);
        for (key, value) in tag_list {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }
        request.send().await?;
        Ok(())
    }
}

fn parse_instance(instance: &aws_sdk_ec2::types::Instance) -> Option<RunnerInstance> {
    let instance_id = instance.instance_id()?.to_string();
    let mut owner = String::new();
    let mut kind = RunnerKind::Org;
    let mut runner_id = None;
    let mut orphan = false;
    for tag in instance.tags() {
        match (tag.key(), tag.value()) {
            (Some(tags::OWNER), Some(value)) => owner = value.to_string(),
            (Some(tags::TYPE), Some(value)) => {
                kind = RunnerKind::from_tag(value).unwrap_or(RunnerKind::Org);
            }
            (Some(tags::RUNNER_ID), Some(value)) => runner_id = value.parse::<i64>().ok(),
            (Some(tags::ORPHAN), Some(value)) => orphan = value == "true",
            _ => {}
        }
    }
    let launch_time = instance
        .launch_time()
        .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()));
    Some(RunnerInstance {
        instance_id,
        launch_time,
        owner,
        kind,
        runner_id,
        orphan,
    })
}
