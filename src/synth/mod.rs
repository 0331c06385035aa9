//! CloudFormation synthesis
//!
//! Turns a validated stack graph into a template document. Resources are
//! emitted in dependency order; disk nodes are inlined into their instance's
//! block device mappings.

pub mod assembly;

pub use assembly::{write_assembly, Assembly, Manifest};

use crate::graph::{
    Bucket, Disk, Expr, Function, Graph, IngressRule, Instance, LogicalId, Resource, Role,
    SecurityGroup, Tags,
};
use crate::stacks::Stack;
use crate::InfraError;
use serde_json::{Map, Value, json};
use tracing::debug;

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Render a stack as a CloudFormation template
pub fn synthesize(stack: &Stack) -> Result<Value, InfraError> {
    stack.graph.validate()?;
    validate_outputs(stack)?;

    let mut template = Map::new();
    template.insert(
        "AWSTemplateFormatVersion".to_string(),
        json!(TEMPLATE_FORMAT_VERSION),
    );
    if let Some(description) = stack.description() {
        template.insert("Description".to_string(), json!(description));
    }

    let parameters: Map<String, Value> = stack
        .graph
        .parameters()
        .map(|(id, p)| {
            let mut param = Map::new();
            param.insert("Type".to_string(), json!(p.kind));
            if let Some(default) = &p.default {
                param.insert("Default".to_string(), json!(default));
            }
            if let Some(description) = &p.description {
                param.insert("Description".to_string(), json!(description));
            }
            (id.to_string(), Value::Object(param))
        })
        .collect();
    if !parameters.is_empty() {
        template.insert("Parameters".to_string(), Value::Object(parameters));
    }

    let mut resources = Map::new();
    for id in stack.graph.topological_order()? {
        let Some(resource) = stack.graph.get(&id) else {
            continue;
        };
        let Some(cfn_type) = resource.kind().cfn_type() else {
            debug!("{} is rendered inline", id);
            continue;
        };

        let mut entry = Map::new();
        entry.insert("Type".to_string(), json!(cfn_type));
        entry.insert(
            "Properties".to_string(),
            properties(stack, &stack.graph, resource)?,
        );
        if let Some(policy) = resource.removal_policy() {
            entry.insert("DeletionPolicy".to_string(), json!(policy.as_cfn()));
            entry.insert("UpdateReplacePolicy".to_string(), json!(policy.as_cfn()));
        }
        resources.insert(id.to_string(), Value::Object(entry));
    }
    template.insert("Resources".to_string(), Value::Object(resources));

    if !stack.outputs().is_empty() {
        let outputs: Map<String, Value> = stack
            .outputs()
            .iter()
            .map(|(id, output)| {
                let mut out = Map::new();
                out.insert("Value".to_string(), output.value.to_json());
                if let Some(description) = &output.description {
                    out.insert("Description".to_string(), json!(description));
                }
                if let Some(export) = &output.export_name {
                    out.insert("Export".to_string(), json!({ "Name": export }));
                }
                (id.clone(), Value::Object(out))
            })
            .collect();
        template.insert("Outputs".to_string(), Value::Object(outputs));
    }

    Ok(Value::Object(template))
}

/// Outputs may only reference declared nodes
fn validate_outputs(stack: &Stack) -> Result<(), InfraError> {
    for (id, output) in stack.outputs() {
        for target in output.value.references() {
            if stack.graph.get(target).is_none() {
                return Err(InfraError::graph(format!(
                    "Output '{}' references unknown node '{}'",
                    id, target
                )));
            }
        }
    }
    Ok(())
}

fn render_tags(tags: &Tags) -> Value {
    Value::Array(
        tags.iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect(),
    )
}

fn properties(stack: &Stack, graph: &Graph, resource: &Resource) -> Result<Value, InfraError> {
    let mut props = match resource {
        Resource::Bucket(bucket) => bucket_properties(bucket),
        Resource::Role(role) => role_properties(role),
        Resource::InstanceProfile(profile) => {
            json!({ "Roles": [Expr::reference(&profile.role).to_json()] })
        }
        Resource::SecurityGroup(group) => security_group_properties(group),
        Resource::Rule(rule) => rule_properties(rule),
        Resource::Instance(instance) => instance_properties(graph, instance)?,
        Resource::Address(_) => json!({ "Domain": "vpc" }),
        Resource::AddressAssociation(assoc) => json!({
            "AllocationId": Expr::get_att(&assoc.address, "AllocationId").to_json(),
            "InstanceId": Expr::reference(&assoc.instance).to_json(),
        }),
        Resource::Function(function) => function_properties(function),
        Resource::AutoDeleteObjects(handler) => json!({
            "ServiceToken": Expr::get_att(&handler.handler, "Arn").to_json(),
            "BucketName": Expr::reference(&handler.bucket).to_json(),
        }),
        Resource::Disk(_) => {
            return Err(InfraError::graph("Disks have no standalone properties"));
        }
    };

    if resource.kind().is_taggable()
        && let Some(own) = resource.tags()
    {
        let tags = stack.effective_tags(own);
        if !tags.is_empty()
            && let Value::Object(map) = &mut props
        {
            map.insert("Tags".to_string(), render_tags(&tags));
        }
    }

    Ok(props)
}

fn bucket_properties(bucket: &Bucket) -> Value {
    let block = &bucket.block_public_access;
    let mut props = json!({
        "BucketEncryption": {
            "ServerSideEncryptionConfiguration": [
                { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" } }
            ]
        },
        "PublicAccessBlockConfiguration": {
            "BlockPublicAcls": block.block_public_acls,
            "BlockPublicPolicy": block.block_public_policy,
            "IgnorePublicAcls": block.ignore_public_acls,
            "RestrictPublicBuckets": block.restrict_public_buckets,
        },
    });
    if bucket.versioned
        && let Value::Object(map) = &mut props
    {
        map.insert(
            "VersioningConfiguration".to_string(),
            json!({ "Status": "Enabled" }),
        );
    }
    props
}

fn role_properties(role: &Role) -> Value {
    let mut props = json!({
        "AssumeRolePolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [{
                "Action": "sts:AssumeRole",
                "Effect": "Allow",
                "Principal": { "Service": role.assumed_by },
            }],
        },
        "ManagedPolicyArns": role.managed_policies.iter().map(Expr::to_json).collect::<Vec<_>>(),
    });
    let Value::Object(map) = &mut props else {
        return props;
    };
    if let Some(description) = &role.description {
        map.insert("Description".to_string(), json!(description));
    }
    if !role.statements.is_empty() {
        let statements: Vec<Value> = role
            .statements
            .iter()
            .map(|s| {
                json!({
                    "Effect": "Allow",
                    "Action": s.actions,
                    "Resource": s.resources.iter().map(Expr::to_json).collect::<Vec<_>>(),
                })
            })
            .collect();
        map.insert(
            "Policies".to_string(),
            json!([{
                "PolicyName": "Inline",
                "PolicyDocument": { "Version": "2012-10-17", "Statement": statements },
            }]),
        );
    }
    props
}

fn function_properties(function: &Function) -> Value {
    let mut props = json!({
        "Code": { "ZipFile": function.source },
        "Handler": function.handler,
        "Role": Expr::get_att(&function.role, "Arn").to_json(),
        "Runtime": function.runtime,
        "Timeout": function.timeout_seconds,
    });
    if let Some(description) = &function.description
        && let Value::Object(map) = &mut props
    {
        map.insert("Description".to_string(), json!(description));
    }
    props
}

fn security_group_properties(group: &SecurityGroup) -> Value {
    let mut props = json!({ "GroupDescription": group.description });
    let Value::Object(map) = &mut props else {
        return props;
    };
    if group.allow_all_outbound {
        map.insert(
            "SecurityGroupEgress".to_string(),
            json!([{
                "CidrIp": "0.0.0.0/0",
                "Description": "Allow all outbound traffic by default",
                "IpProtocol": "-1",
            }]),
        );
    }
    if let Some(vpc_id) = &group.vpc_id {
        map.insert("VpcId".to_string(), json!(vpc_id));
    }
    props
}

fn rule_properties(rule: &IngressRule) -> Value {
    json!({
        "GroupId": Expr::get_att(&rule.group, "GroupId").to_json(),
        "IpProtocol": rule.protocol.as_str(),
        "FromPort": rule.port,
        "ToPort": rule.port,
        "CidrIp": rule.cidr,
        "Description": rule.description,
    })
}

fn disk_mapping(disk: &Disk) -> Value {
    json!({
        "DeviceName": disk.device_name,
        "Ebs": {
            "DeleteOnTermination": disk.delete_on_termination,
            "Encrypted": disk.encrypted,
            "VolumeSize": disk.size_gib,
            "VolumeType": disk.volume_type.as_str(),
        },
    })
}

fn instance_properties(graph: &Graph, instance: &Instance) -> Result<Value, InfraError> {
    let mappings = instance
        .disks
        .iter()
        .map(|id| match graph.get(id) {
            Some(Resource::Disk(disk)) => Ok(disk_mapping(disk)),
            _ => Err(InfraError::graph(format!("'{}' is not a disk", id))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut props = json!({
        "InstanceType": instance.instance_type,
        "ImageId": instance.image.to_json(),
        "IamInstanceProfile": Expr::reference(&instance.profile).to_json(),
        "SecurityGroupIds": [Expr::get_att(&instance.security_group, "GroupId").to_json()],
        "BlockDeviceMappings": mappings,
    });
    let Value::Object(map) = &mut props else {
        return Ok(props);
    };
    if let Some(subnet_id) = &instance.subnet_id {
        map.insert("SubnetId".to_string(), json!(subnet_id));
    }
    if let Some(script) = &instance.user_data {
        map.insert(
            "UserData".to_string(),
            Expr::Base64(Box::new(Expr::literal(script.as_str()))).to_json(),
        );
    }
    Ok(props)
}

/// Look up a synthesized resource by logical id
pub fn template_resource<'a>(template: &'a Value, id: &LogicalId) -> Option<&'a Value> {
    template.get("Resources")?.get(id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentTarget;
    use crate::graph::{Address, BlockPublicAccess, BucketEncryption, RemovalPolicy};
    use crate::stacks::Output;

    #[test]
    fn test_bucket_rendering() {
        let mut stack = Stack::new("S", &DeploymentTarget::default()).with_description("d");
        stack
            .graph
            .add(
                "Bucket",
                Resource::Bucket(Bucket {
                    versioned: true,
                    encryption: BucketEncryption::S3Managed,
                    block_public_access: BlockPublicAccess::BLOCK_ALL,
                    removal_policy: RemovalPolicy::Retain,
                    auto_delete_objects: false,
                    tags: Tags::new(),
                }),
            )
            .unwrap();

        let template = synthesize(&stack).unwrap();
        assert_eq!(template["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(template["Description"], "d");

        let bucket = &template["Resources"]["Bucket"];
        assert_eq!(bucket["Type"], "AWS::S3::Bucket");
        assert_eq!(bucket["DeletionPolicy"], "Retain");
        assert_eq!(bucket["UpdateReplacePolicy"], "Retain");
        assert_eq!(
            bucket["Properties"]["VersioningConfiguration"]["Status"],
            "Enabled"
        );
        assert_eq!(
            bucket["Properties"]["PublicAccessBlockConfiguration"]["RestrictPublicBuckets"],
            true
        );
        assert!(bucket["Properties"].get("Tags").is_none());
    }

    #[test]
    fn test_stack_tags_rendered() {
        let mut stack = Stack::new("S", &DeploymentTarget::default());
        stack
            .graph
            .add("Eip", Resource::Address(Address::default()))
            .unwrap();
        stack.add_tag("Project", "MagicMailBook");

        let template = synthesize(&stack).unwrap();
        assert_eq!(
            template["Resources"]["Eip"]["Properties"]["Tags"],
            json!([{ "Key": "Project", "Value": "MagicMailBook" }])
        );
    }

    #[test]
    fn test_emptying_handler_rendering() {
        use crate::config::{Context, ENVIRONMENT_KEY, PROJECT_KEY};
        use crate::stacks::storage::{
            AUTO_DELETE_FUNCTION_ID, AUTO_DELETE_HANDLER_ID, AUTO_DELETE_ROLE_ID, BUCKET_ID,
            storage_stack,
        };

        let ctx = Context::new()
            .with(ENVIRONMENT_KEY, "dev")
            .with(PROJECT_KEY, "MagicMailBook");
        let stack = storage_stack(&ctx, &DeploymentTarget::default()).unwrap();
        let template = synthesize(&stack).unwrap();
        let resources = &template["Resources"];

        let handler = &resources[AUTO_DELETE_HANDLER_ID];
        assert_eq!(handler["Type"], "Custom::S3AutoDeleteObjects");
        assert_eq!(
            handler["Properties"]["ServiceToken"],
            json!({ "Fn::GetAtt": [AUTO_DELETE_FUNCTION_ID, "Arn"] })
        );
        assert_eq!(handler["Properties"]["BucketName"], json!({ "Ref": BUCKET_ID }));

        let function = &resources[AUTO_DELETE_FUNCTION_ID]["Properties"];
        assert_eq!(function["Runtime"], "python3.12");
        assert_eq!(function["Handler"], "index.handler");
        assert!(function["Code"]["ZipFile"].as_str().unwrap().contains("cfnresponse"));
        assert!(function.get("Tags").is_none());

        let policy = &resources[AUTO_DELETE_ROLE_ID]["Properties"]["Policies"][0];
        assert_eq!(
            policy["PolicyDocument"]["Statement"][0]["Resource"][0],
            json!({ "Fn::GetAtt": [BUCKET_ID, "Arn"] })
        );

        let ids: Vec<&String> = resources.as_object().unwrap().keys().collect();
        let position = |id: &str| ids.iter().position(|k| k.as_str() == id).unwrap();
        assert!(position(BUCKET_ID) < position(AUTO_DELETE_HANDLER_ID));
        assert!(position(AUTO_DELETE_FUNCTION_ID) < position(AUTO_DELETE_HANDLER_ID));
    }

    #[test]
    fn test_output_with_unknown_reference_fails() {
        let mut stack = Stack::new("S", &DeploymentTarget::default());
        stack
            .add_output(
                "Out",
                Output {
                    value: Expr::reference(&LogicalId::new("Nope")),
                    description: None,
                    export_name: None,
                },
            )
            .unwrap();
        assert!(matches!(synthesize(&stack), Err(InfraError::Graph(_))));
    }
}
