//! Compute stack: the self-hosted GitLab server
//!
//! One instance in the default VPC with a root disk, a deletion-protected data
//! disk, HTTP/HTTPS ingress, an SSM-only role and a static public address.

use super::{Output, Stack};
use crate::bootstrap::{BootstrapParams, BootstrapScript, Section};
use crate::config::{Context, DeploymentTarget, SUBNET_ID_KEY, VPC_ID_KEY};
use crate::graph::{
    Address, AddressAssociation, Disk, Expr, IngressRule, Instance, InstanceProfile, Parameter,
    Resource, Role, SecurityGroup, Tags, VolumeType,
};
use crate::InfraError;
use tracing::{debug, info};

pub const STACK_NAME: &str = "GitLabServerStack";
pub const STACK_DESCRIPTION: &str = "Stack for deploying the self-hosted GitLab CE server";

pub const ROLE_ID: &str = "GitLabInstanceRole";
pub const PROFILE_ID: &str = "GitLabInstanceProfile";
pub const SECURITY_GROUP_ID: &str = "GitLabSecurityGroup";
pub const ROOT_DISK_ID: &str = "GitLabRootVolume";
pub const DATA_DISK_ID: &str = "GitLabDataVolume";
pub const INSTANCE_ID: &str = "GitLabInstance";
pub const ADDRESS_ID: &str = "GitLabEIP";
pub const ASSOCIATION_ID: &str = "GitLabEIPAssociation";
pub const IMAGE_PARAMETER_ID: &str = "UbuntuImageId";
pub const PUBLIC_IP_OUTPUT: &str = "GitLabInstancePublicIp";
pub const SSM_COMMAND_OUTPUT: &str = "SsmCommand";

pub const INSTANCE_TYPE: &str = "t3.large";
pub const ROOT_DISK_GIB: u32 = 50;
pub const DATA_DISK_GIB: u32 = 100;
pub const ROOT_DEVICE_NAME: &str = "/dev/sda1";
pub const DATA_DEVICE_NAME: &str = "/dev/sdf";

/// Ports open to the world
pub const INGRESS_PORTS: [(u16, &str); 2] = [(80, "Allow HTTP access"), (443, "Allow HTTPS access")];

/// The only managed policy granted to the instance role
pub const SSM_MANAGED_POLICY: &str = "AmazonSSMManagedInstanceCore";

/// Public SSM parameter holding the current Ubuntu 22.04 amd64 image id
pub const UBUNTU_IMAGE_PARAMETER: &str =
    "/aws/service/canonical/ubuntu/server/22.04/stable/current/amd64/hvm/ebs-gp2/ami-id";

/// Build the compute stack
pub fn compute_stack(
    context: &Context,
    target: &DeploymentTarget,
    bootstrap: &BootstrapParams,
) -> Result<Stack, InfraError> {
    let mut stack = Stack::new(STACK_NAME, target).with_description(STACK_DESCRIPTION);
    let graph = &mut stack.graph;

    let role = graph.add(
        ROLE_ID,
        Resource::Role(Role {
            assumed_by: "ec2.amazonaws.com".to_string(),
            description: Some(
                "IAM Role for GitLab EC2 instance to allow SSM access".to_string(),
            ),
            managed_policies: vec![Expr::Join(vec![
                Expr::literal("arn:"),
                Expr::Partition,
                Expr::literal(format!(":iam::aws:policy/{}", SSM_MANAGED_POLICY)),
            ])],
            statements: Vec::new(),
            tags: Tags::new(),
        }),
    )?;
    let profile = graph.add(PROFILE_ID, Resource::InstanceProfile(InstanceProfile { role }))?;

    let vpc_id = context.get(VPC_ID_KEY);
    let subnet_id = context.get(SUBNET_ID_KEY);
    match (&vpc_id, &subnet_id) {
        (Some(vpc), Some(subnet)) => info!("Placing GitLab server in {} ({})", subnet, vpc),
        (None, None) => info!("Placing GitLab server in the default VPC"),
        (Some(_), None) => return Err(InfraError::missing_context(SUBNET_ID_KEY)),
        (None, Some(_)) => return Err(InfraError::missing_context(VPC_ID_KEY)),
    }
    let security_group = graph.add(
        SECURITY_GROUP_ID,
        Resource::SecurityGroup(SecurityGroup {
            description: "Allow HTTP, HTTPS access to GitLab server".to_string(),
            vpc_id,
            allow_all_outbound: true,
            tags: Tags::new(),
        }),
    )?;
    for (port, description) in INGRESS_PORTS {
        graph.add(
            format!("{}Ingress{}", SECURITY_GROUP_ID, port),
            Resource::Rule(IngressRule::tcp_from_anywhere(&security_group, port, description)),
        )?;
    }

    let root_disk = graph.add(
        ROOT_DISK_ID,
        Resource::Disk(Disk {
            device_name: ROOT_DEVICE_NAME.to_string(),
            size_gib: ROOT_DISK_GIB,
            volume_type: VolumeType::Gp3,
            encrypted: true,
            delete_on_termination: true,
        }),
    )?;
    let data_disk = graph.add(
        DATA_DISK_ID,
        Resource::Disk(Disk {
            device_name: DATA_DEVICE_NAME.to_string(),
            size_gib: DATA_DISK_GIB,
            volume_type: VolumeType::Gp3,
            encrypted: true,
            delete_on_termination: false,
        }),
    )?;

    let image = graph.add_parameter(
        IMAGE_PARAMETER_ID,
        Parameter {
            kind: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
            default: Some(UBUNTU_IMAGE_PARAMETER.to_string()),
            description: Some("Ubuntu 22.04 (Jammy) amd64 server image".to_string()),
        },
    )?;

    let script = BootstrapScript::new(bootstrap.clone())?
        .user_data(Section::All)?
        .render_checked()?;
    debug!("Bootstrap user-data is {} bytes", script.len());

    let instance = graph.add(
        INSTANCE_ID,
        Resource::Instance(Instance {
            instance_type: INSTANCE_TYPE.to_string(),
            image: Expr::reference(&image),
            security_group,
            profile,
            disks: vec![root_disk, data_disk],
            subnet_id,
            user_data: Some(script),
            tags: Tags::from([("Name".to_string(), format!("{}/{}", STACK_NAME, INSTANCE_ID))]),
        }),
    )?;

    let address = graph.add(ADDRESS_ID, Resource::Address(Address::default()))?;
    graph.add(
        ASSOCIATION_ID,
        Resource::AddressAssociation(AddressAssociation {
            address: address.clone(),
            instance: instance.clone(),
        }),
    )?;

    stack.add_output(
        PUBLIC_IP_OUTPUT,
        Output {
            value: Expr::reference(&address),
            description: Some(
                "Static Public IP (Elastic IP) of the GitLab EC2 instance".to_string(),
            ),
            export_name: None,
        },
    )?;
    stack.add_output(
        SSM_COMMAND_OUTPUT,
        Output {
            value: Expr::Join(vec![
                Expr::literal("aws ssm start-session --target "),
                Expr::reference(&instance),
            ]),
            description: Some("Command to connect via SSM Session Manager".to_string()),
            export_name: None,
        },
    )?;

    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    fn stack() -> Stack {
        compute_stack(
            &Context::new(),
            &DeploymentTarget::default(),
            &BootstrapParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_graph_is_valid() {
        stack().graph.validate().unwrap();
    }

    #[test]
    fn test_role_has_only_ssm_policy() {
        let stack = stack();
        let Some(Resource::Role(role)) = stack.graph.find(ROLE_ID) else {
            panic!("role missing");
        };
        assert_eq!(role.assumed_by, "ec2.amazonaws.com");
        assert_eq!(role.managed_policies.len(), 1);
        assert!(format!("{:?}", role.managed_policies[0]).contains(SSM_MANAGED_POLICY));
    }

    #[test]
    fn test_default_vpc_unless_configured() {
        let Some(Resource::SecurityGroup(sg)) = stack().graph.find(SECURITY_GROUP_ID).cloned()
        else {
            panic!("security group missing");
        };
        assert!(sg.vpc_id.is_none());

        let pinned = compute_stack(
            &Context::new()
                .with(VPC_ID_KEY, "vpc-0abc")
                .with(SUBNET_ID_KEY, "subnet-0def"),
            &DeploymentTarget::default(),
            &BootstrapParams::default(),
        )
        .unwrap();
        let Some(Resource::SecurityGroup(sg)) = pinned.graph.find(SECURITY_GROUP_ID) else {
            panic!("security group missing");
        };
        assert_eq!(sg.vpc_id.as_deref(), Some("vpc-0abc"));
        let Some(Resource::Instance(instance)) = pinned.graph.find(INSTANCE_ID) else {
            panic!("instance missing");
        };
        assert_eq!(instance.subnet_id.as_deref(), Some("subnet-0def"));
    }

    /// A pinned security group is unusable unless the instance is in the same VPC
    #[test]
    fn test_vpc_and_subnet_set_together() {
        let only_vpc = Context::new().with(VPC_ID_KEY, "vpc-0abc");
        let err = compute_stack(&only_vpc, &DeploymentTarget::default(), &BootstrapParams::default())
            .unwrap_err();
        assert!(matches!(err, InfraError::MissingContext { ref key } if key == SUBNET_ID_KEY));

        let only_subnet = Context::new().with(SUBNET_ID_KEY, "subnet-0def");
        let err = compute_stack(&only_subnet, &DeploymentTarget::default(), &BootstrapParams::default())
            .unwrap_err();
        assert!(matches!(err, InfraError::MissingContext { ref key } if key == VPC_ID_KEY));
    }

    #[test]
    fn test_instance_carries_bootstrap_script() {
        let stack = stack();
        let Some(Resource::Instance(instance)) = stack.graph.find(INSTANCE_ID) else {
            panic!("instance missing");
        };
        assert_eq!(instance.instance_type, INSTANCE_TYPE);
        let script = instance.user_data.as_deref().unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("chown git:git \"/var/opt/gitlab\""));
    }

    #[test]
    fn test_address_bound_to_instance() {
        let stack = stack();
        let associations = stack.graph.nodes_of_kind(ResourceKind::AddressAssociation);
        assert_eq!(associations.len(), 1);
        let Resource::AddressAssociation(assoc) = associations[0].1 else {
            panic!("wrong kind");
        };
        assert_eq!(assoc.address.as_str(), ADDRESS_ID);
        assert_eq!(assoc.instance.as_str(), INSTANCE_ID);
    }

    #[test]
    fn test_invalid_bootstrap_params_fail() {
        let params = BootstrapParams {
            mount_point: "not/absolute".into(),
            ..Default::default()
        };
        assert!(compute_stack(&Context::new(), &DeploymentTarget::default(), &params).is_err());
    }
}
