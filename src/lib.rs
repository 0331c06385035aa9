//! magicmail-infra library
//!
//! Declares the MagicMail infrastructure as explicit resource graphs and
//! synthesizes them into CloudFormation templates.
//!
//! # Stacks
//!
//! - **MagicmailInfraStack**: versioned, encrypted, private assets bucket whose
//!   teardown behavior depends on the `environment` context value
//! - **GitLabServerStack**: one GitLab server with a durable data disk, a
//!   static address and SSM-only access
//!
//! The GitLab server's first-boot script is rendered from a template
//! ([`bootstrap`]) and can also be run natively on the instance ([`provision`]).

pub mod bootstrap;
pub mod config;
pub mod graph;
pub mod provision;
pub mod stacks;
pub mod synth;
pub mod template;
pub mod userdata;

mod error;

pub use error::InfraError;

use bootstrap::BootstrapParams;
use config::{Context, DeploymentTarget};
use stacks::{App, compute, storage};
use tracing::info;

/// Tag applied to every taggable resource of the app
pub const APP_TAG: (&str, &str) = ("Project", "MagicMailBook");

/// Build the app with both stacks against an explicit deployment target
pub fn build_app(context: &Context, target: &DeploymentTarget) -> Result<App, InfraError> {
    build_app_with(context, target, &BootstrapParams::default())
}

/// Like [`build_app`], with custom bootstrap parameters for the GitLab server
pub fn build_app_with(
    context: &Context,
    target: &DeploymentTarget,
    bootstrap: &BootstrapParams,
) -> Result<App, InfraError> {
    info!("Building app for {}", target.environment_string());

    let mut app = App::new();
    app.add_stack(storage::storage_stack(context, target)?)?;
    app.add_stack(compute::compute_stack(context, target, bootstrap)?)?;

    let (key, value) = APP_TAG;
    app.add_tag(key, value);

    Ok(app)
}
