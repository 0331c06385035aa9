//! Storage stack: the MagicMail assets bucket

use super::{Output, Stack};
use crate::config::{Context, DeploymentTarget, ENVIRONMENT_KEY, PRODUCTION_ENVIRONMENT, PROJECT_KEY};
use crate::graph::{
    AutoDeleteObjects, BlockPublicAccess, Bucket, BucketEncryption, Expr, Function, Graph,
    LogicalId, PolicyStatement, RemovalPolicy, Resource, Role, Tags,
};
use crate::InfraError;
use tracing::info;

pub const STACK_NAME: &str = "MagicmailInfraStack";
pub const STACK_DESCRIPTION: &str = "Stack for MagicMail core infrastructure (e.g., S3 bucket)";
pub const BUCKET_ID: &str = "MagicMailAssetsBucket";
pub const BUCKET_NAME_OUTPUT: &str = "AssetsBucketNameOutput";
pub const BUCKET_ARN_OUTPUT: &str = "AssetsBucketArnOutput";

/// Tag that marks a bucket for emptying before deletion
pub const AUTO_DELETE_TAG: &str = "aws-cdk:auto-delete-objects";

pub const AUTO_DELETE_ROLE_ID: &str = "AutoDeleteObjectsRole";
pub const AUTO_DELETE_FUNCTION_ID: &str = "AutoDeleteObjectsFunction";
pub const AUTO_DELETE_HANDLER_ID: &str = "MagicMailAssetsBucketAutoDeleteObjects";

const AUTO_DELETE_SOURCE: &str = include_str!("auto_delete_objects.py");
const AUTO_DELETE_RUNTIME: &str = "python3.12";
const AUTO_DELETE_TIMEOUT_SECONDS: u32 = 900;

/// Export name of a bucket output, unique per project and environment
pub fn export_name(project: &str, environment: &str, field: &str) -> String {
    format!("{}-{}-{}", project, environment, field)
}

/// Teardown behavior for an environment: (removal policy, auto-delete objects)
pub fn teardown_policy(environment: &str) -> (RemovalPolicy, bool) {
    if environment == PRODUCTION_ENVIRONMENT {
        (RemovalPolicy::Retain, false)
    } else {
        (RemovalPolicy::Destroy, true)
    }
}

/// Build the storage stack
///
/// Fails with [`InfraError::MissingContext`] before declaring anything when
/// `environment` or `project` is missing or empty.
pub fn storage_stack(context: &Context, target: &DeploymentTarget) -> Result<Stack, InfraError> {
    let environment = context.require(ENVIRONMENT_KEY)?;
    let project = context.require(PROJECT_KEY)?;

    let (removal_policy, auto_delete_objects) = teardown_policy(&environment);
    info!(
        "Storage stack for {}/{}: removal policy {:?}",
        project, environment, removal_policy
    );

    let mut tags = Tags::new();
    tags.insert("Project".to_string(), project.clone());
    tags.insert("Environment".to_string(), environment.clone());
    if auto_delete_objects {
        tags.insert(AUTO_DELETE_TAG.to_string(), "true".to_string());
    }

    let mut stack = Stack::new(STACK_NAME, target).with_description(STACK_DESCRIPTION);
    let bucket = stack.graph.add(
        BUCKET_ID,
        Resource::Bucket(Bucket {
            versioned: true,
            encryption: BucketEncryption::S3Managed,
            block_public_access: BlockPublicAccess::BLOCK_ALL,
            removal_policy,
            auto_delete_objects,
            tags,
        }),
    )?;

    if auto_delete_objects {
        add_auto_delete_objects(&mut stack.graph, &bucket)?;
    }

    stack.add_output(
        BUCKET_NAME_OUTPUT,
        Output {
            value: Expr::reference(&bucket),
            description: Some(format!("The name of the S3 bucket for {} assets", environment)),
            export_name: Some(export_name(&project, &environment, "AssetsBucketName")),
        },
    )?;
    stack.add_output(
        BUCKET_ARN_OUTPUT,
        Output {
            value: Expr::get_att(&bucket, "Arn"),
            description: Some(format!("The ARN of the S3 bucket for {} assets", environment)),
            export_name: Some(export_name(&project, &environment, "AssetsBucketArn")),
        },
    )?;

    Ok(stack)
}

/// Declare the handler that empties `bucket` (every object version) when the
/// stack deletes it
fn add_auto_delete_objects(graph: &mut Graph, bucket: &LogicalId) -> Result<(), InfraError> {
    let bucket_arn = Expr::get_att(bucket, "Arn");
    let role = graph.add(
        AUTO_DELETE_ROLE_ID,
        Resource::Role(Role {
            assumed_by: "lambda.amazonaws.com".to_string(),
            description: Some("Empties the assets bucket on stack deletion".to_string()),
            managed_policies: vec![Expr::Join(vec![
                Expr::literal("arn:"),
                Expr::Partition,
                Expr::literal(":iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"),
            ])],
            statements: vec![PolicyStatement {
                actions: ["s3:DeleteObject*", "s3:GetBucket*", "s3:List*"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                resources: vec![
                    bucket_arn.clone(),
                    Expr::Join(vec![bucket_arn, Expr::literal("/*")]),
                ],
            }],
            tags: Tags::new(),
        }),
    )?;

    let function = graph.add(
        AUTO_DELETE_FUNCTION_ID,
        Resource::Function(Function {
            role,
            runtime: AUTO_DELETE_RUNTIME.to_string(),
            handler: "index.handler".to_string(),
            source: AUTO_DELETE_SOURCE.to_string(),
            timeout_seconds: AUTO_DELETE_TIMEOUT_SECONDS,
            description: Some("Deletes every object version in a bucket being torn down".to_string()),
        }),
    )?;

    graph.add(
        AUTO_DELETE_HANDLER_ID,
        Resource::AutoDeleteObjects(AutoDeleteObjects {
            handler: function,
            bucket: bucket.clone(),
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(environment: &str, project: &str) -> Context {
        Context::new()
            .with(ENVIRONMENT_KEY, environment)
            .with(PROJECT_KEY, project)
    }

    fn bucket(stack: &Stack) -> &Bucket {
        match stack.graph.find(BUCKET_ID) {
            Some(Resource::Bucket(b)) => b,
            other => panic!("expected bucket, got {:?}", other),
        }
    }

    #[test]
    fn test_prod_retains_bucket() {
        let stack = storage_stack(&context("prod", "MagicMailBook"), &DeploymentTarget::default())
            .unwrap();
        let bucket = bucket(&stack);
        assert_eq!(bucket.removal_policy, RemovalPolicy::Retain);
        assert!(!bucket.auto_delete_objects);
        assert!(!bucket.tags.contains_key(AUTO_DELETE_TAG));
        assert_eq!(stack.graph.len(), 1);
        assert!(stack.graph.find(AUTO_DELETE_HANDLER_ID).is_none());
    }

    #[test]
    fn test_non_prod_declares_emptying_handler() {
        let stack = storage_stack(&context("dev", "MagicMailBook"), &DeploymentTarget::default())
            .unwrap();
        stack.graph.validate().unwrap();

        let handler = match stack.graph.find(AUTO_DELETE_HANDLER_ID) {
            Some(Resource::AutoDeleteObjects(h)) => h,
            other => panic!("expected emptying handler, got {:?}", other),
        };
        assert_eq!(handler.bucket.as_str(), BUCKET_ID);
        assert_eq!(handler.handler.as_str(), AUTO_DELETE_FUNCTION_ID);

        let function = match stack.graph.find(AUTO_DELETE_FUNCTION_ID) {
            Some(Resource::Function(f)) => f,
            other => panic!("expected function, got {:?}", other),
        };
        assert_eq!(function.role.as_str(), AUTO_DELETE_ROLE_ID);
        assert!(function.source.contains("object_versions.delete()"));

        let role = match stack.graph.find(AUTO_DELETE_ROLE_ID) {
            Some(Resource::Role(r)) => r,
            other => panic!("expected role, got {:?}", other),
        };
        assert_eq!(role.assumed_by, "lambda.amazonaws.com");
        let statement = &role.statements[0];
        assert!(statement.actions.iter().any(|a| a == "s3:DeleteObject*"));
        assert!(statement
            .resources
            .contains(&Expr::get_att(&LogicalId::new(BUCKET_ID), "Arn")));
    }

    #[test]
    fn test_non_prod_destroys_bucket() {
        for env in ["dev", "staging", "Prod", "production"] {
            let stack = storage_stack(&context(env, "MagicMailBook"), &DeploymentTarget::default())
                .unwrap();
            let bucket = bucket(&stack);
            assert_eq!(bucket.removal_policy, RemovalPolicy::Destroy, "{}", env);
            assert!(bucket.auto_delete_objects, "{}", env);
        }
    }

    #[test]
    fn test_bucket_always_hardened() {
        let stack = storage_stack(&context("dev", "p"), &DeploymentTarget::default()).unwrap();
        let bucket = bucket(&stack);
        assert!(bucket.versioned);
        assert_eq!(bucket.encryption, BucketEncryption::S3Managed);
        assert!(bucket.block_public_access.is_block_all());
    }

    #[test]
    fn test_bucket_tags() {
        let stack = storage_stack(&context("staging", "MagicMailBook"), &DeploymentTarget::default())
            .unwrap();
        let tags = &bucket(&stack).tags;
        assert_eq!(tags.get("Project").map(String::as_str), Some("MagicMailBook"));
        assert_eq!(tags.get("Environment").map(String::as_str), Some("staging"));
    }

    #[test]
    fn test_export_names() {
        let stack = storage_stack(&context("staging", "MagicMailBook"), &DeploymentTarget::default())
            .unwrap();
        assert_eq!(
            stack.output(BUCKET_NAME_OUTPUT).unwrap().export_name.as_deref(),
            Some("MagicMailBook-staging-AssetsBucketName")
        );
        assert_eq!(
            stack.output(BUCKET_ARN_OUTPUT).unwrap().export_name.as_deref(),
            Some("MagicMailBook-staging-AssetsBucketArn")
        );
    }

    #[test]
    fn test_missing_context_declares_nothing() {
        let err = storage_stack(&Context::new().with(PROJECT_KEY, "p"), &DeploymentTarget::default())
            .unwrap_err();
        assert!(matches!(err, InfraError::MissingContext { ref key } if key == ENVIRONMENT_KEY));
    }
}
