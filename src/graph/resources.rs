//! Resource node payloads

use super::{Expr, LogicalId};
use std::collections::BTreeMap;

/// Resource tags (sorted for deterministic output)
pub type Tags = BTreeMap<String, String>;

/// Kind of a resource node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Bucket,
    Role,
    InstanceProfile,
    SecurityGroup,
    Rule,
    Disk,
    Instance,
    Address,
    AddressAssociation,
    Function,
    AutoDeleteObjects,
}

impl ResourceKind {
    /// CloudFormation resource type; `None` for nodes rendered inline
    pub fn cfn_type(&self) -> Option<&'static str> {
        match self {
            Self::Bucket => Some("AWS::S3::Bucket"),
            Self::Role => Some("AWS::IAM::Role"),
            Self::InstanceProfile => Some("AWS::IAM::InstanceProfile"),
            Self::SecurityGroup => Some("AWS::EC2::SecurityGroup"),
            Self::Rule => Some("AWS::EC2::SecurityGroupIngress"),
            Self::Disk => None,
            Self::Instance => Some("AWS::EC2::Instance"),
            Self::Address => Some("AWS::EC2::EIP"),
            Self::AddressAssociation => Some("AWS::EC2::EIPAssociation"),
            Self::Function => Some("AWS::Lambda::Function"),
            Self::AutoDeleteObjects => Some("Custom::S3AutoDeleteObjects"),
        }
    }

    /// Whether the resource type accepts a `Tags` property
    pub fn is_taggable(&self) -> bool {
        matches!(
            self,
            Self::Bucket | Self::Role | Self::SecurityGroup | Self::Instance | Self::Address
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bucket => write!(f, "bucket"),
            Self::Role => write!(f, "role"),
            Self::InstanceProfile => write!(f, "instance profile"),
            Self::SecurityGroup => write!(f, "security group"),
            Self::Rule => write!(f, "ingress rule"),
            Self::Disk => write!(f, "disk"),
            Self::Instance => write!(f, "instance"),
            Self::Address => write!(f, "address"),
            Self::AddressAssociation => write!(f, "address association"),
            Self::Function => write!(f, "function"),
            Self::AutoDeleteObjects => write!(f, "auto-delete objects handler"),
        }
    }
}

/// What happens to a resource when its stack is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Keep the physical resource
    Retain,
    /// Delete the physical resource
    #[default]
    Destroy,
}

impl RemovalPolicy {
    /// CloudFormation `DeletionPolicy` value
    pub fn as_cfn(&self) -> &'static str {
        match self {
            Self::Retain => "Retain",
            Self::Destroy => "Delete",
        }
    }
}

/// Server-side encryption mode of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketEncryption {
    /// SSE-S3 (AES256)
    #[default]
    S3Managed,
}

/// Public access block configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPublicAccess {
    pub block_public_acls: bool,
    pub block_public_policy: bool,
    pub ignore_public_acls: bool,
    pub restrict_public_buckets: bool,
}

impl BlockPublicAccess {
    /// Every flag set
    pub const BLOCK_ALL: Self = Self {
        block_public_acls: true,
        block_public_policy: true,
        ignore_public_acls: true,
        restrict_public_buckets: true,
    };

    pub fn is_block_all(&self) -> bool {
        *self == Self::BLOCK_ALL
    }
}

/// Object-storage bucket
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub versioned: bool,
    pub encryption: BucketEncryption,
    pub block_public_access: BlockPublicAccess,
    pub removal_policy: RemovalPolicy,
    /// Empty the bucket before deletion on teardown; requires an
    /// [`AutoDeleteObjects`] node targeting the bucket
    pub auto_delete_objects: bool,
    pub tags: Tags,
}

/// Allow statement of an inline role policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Expr>,
}

/// IAM role assumed by a service
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub assumed_by: String,
    pub description: Option<String>,
    pub managed_policies: Vec<Expr>,
    /// Rendered as a single inline policy
    pub statements: Vec<PolicyStatement>,
    pub tags: Tags,
}

/// Instance profile exposing a role to an instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProfile {
    pub role: LogicalId,
}

/// Security group (rules are separate `Rule` nodes)
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroup {
    pub description: String,
    /// `None` places the group in the account's default VPC
    pub vpc_id: Option<String>,
    pub allow_all_outbound: bool,
    pub tags: Tags,
}

/// IP protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Inbound traffic rule attached to a security group
#[derive(Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub group: LogicalId,
    pub protocol: Protocol,
    pub port: u16,
    pub cidr: String,
    pub description: String,
}

impl IngressRule {
    /// Rule allowing TCP on `port` from any IPv4 source
    pub fn tcp_from_anywhere(group: &LogicalId, port: u16, description: impl Into<String>) -> Self {
        Self {
            group: group.clone(),
            protocol: Protocol::Tcp,
            port,
            cidr: ANY_IPV4.to_string(),
            description: description.into(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.cidr == ANY_IPV4
    }
}

/// CIDR matching every IPv4 address
pub const ANY_IPV4: &str = "0.0.0.0/0";

/// EBS volume type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeType {
    Gp2,
    #[default]
    Gp3,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gp2 => "gp2",
            Self::Gp3 => "gp3",
        }
    }
}

/// Block device attached to an instance at launch
#[derive(Debug, Clone, PartialEq)]
pub struct Disk {
    pub device_name: String,
    pub size_gib: u32,
    pub volume_type: VolumeType,
    pub encrypted: bool,
    pub delete_on_termination: bool,
}

/// Virtual machine
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_type: String,
    pub image: Expr,
    pub security_group: LogicalId,
    pub profile: LogicalId,
    pub disks: Vec<LogicalId>,
    /// `None` launches into the default VPC's default subnet
    pub subnet_id: Option<String>,
    /// Raw first-boot script, base64-wrapped at synthesis
    pub user_data: Option<String>,
    pub tags: Tags,
}

/// Static public address
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Address {
    pub tags: Tags,
}

/// Binding of a static address to an instance
#[derive(Debug, Clone, PartialEq)]
pub struct AddressAssociation {
    pub address: LogicalId,
    pub instance: LogicalId,
}

/// Serverless function with inline source
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub role: LogicalId,
    pub runtime: String,
    pub handler: String,
    pub source: String,
    pub timeout_seconds: u32,
    pub description: Option<String>,
}

/// Custom resource that empties a bucket when the stack deletes it
///
/// It depends on the bucket, so teardown removes it (running the handler)
/// before the bucket itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoDeleteObjects {
    pub handler: LogicalId,
    pub bucket: LogicalId,
}

/// A node in the resource graph
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Bucket(Bucket),
    Role(Role),
    InstanceProfile(InstanceProfile),
    SecurityGroup(SecurityGroup),
    Rule(IngressRule),
    Disk(Disk),
    Instance(Instance),
    Address(Address),
    AddressAssociation(AddressAssociation),
    Function(Function),
    AutoDeleteObjects(AutoDeleteObjects),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Bucket(_) => ResourceKind::Bucket,
            Self::Role(_) => ResourceKind::Role,
            Self::InstanceProfile(_) => ResourceKind::InstanceProfile,
            Self::SecurityGroup(_) => ResourceKind::SecurityGroup,
            Self::Rule(_) => ResourceKind::Rule,
            Self::Disk(_) => ResourceKind::Disk,
            Self::Instance(_) => ResourceKind::Instance,
            Self::Address(_) => ResourceKind::Address,
            Self::AddressAssociation(_) => ResourceKind::AddressAssociation,
            Self::Function(_) => ResourceKind::Function,
            Self::AutoDeleteObjects(_) => ResourceKind::AutoDeleteObjects,
        }
    }

    /// Typed references to other nodes with the kind each must have
    pub fn typed_references(&self) -> Vec<(&LogicalId, ResourceKind)> {
        match self {
            Self::InstanceProfile(p) => vec![(&p.role, ResourceKind::Role)],
            Self::Rule(r) => vec![(&r.group, ResourceKind::SecurityGroup)],
            Self::Instance(i) => {
                let mut refs = vec![
                    (&i.security_group, ResourceKind::SecurityGroup),
                    (&i.profile, ResourceKind::InstanceProfile),
                ];
                refs.extend(i.disks.iter().map(|d| (d, ResourceKind::Disk)));
                refs
            }
            Self::AddressAssociation(a) => vec![
                (&a.address, ResourceKind::Address),
                (&a.instance, ResourceKind::Instance),
            ],
            Self::Function(f) => vec![(&f.role, ResourceKind::Role)],
            Self::AutoDeleteObjects(a) => vec![
                (&a.handler, ResourceKind::Function),
                (&a.bucket, ResourceKind::Bucket),
            ],
            Self::Bucket(_) | Self::Role(_) | Self::SecurityGroup(_) | Self::Disk(_) | Self::Address(_) => {
                Vec::new()
            }
        }
    }

    /// Expressions embedded in the node (may reference nodes or parameters)
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Self::Role(r) => r
                .managed_policies
                .iter()
                .chain(r.statements.iter().flat_map(|s| s.resources.iter()))
                .collect(),
            Self::Instance(i) => vec![&i.image],
            _ => Vec::new(),
        }
    }

    /// Resource-level tags, if the node carries any
    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Self::Bucket(b) => Some(&b.tags),
            Self::Role(r) => Some(&r.tags),
            Self::SecurityGroup(g) => Some(&g.tags),
            Self::Instance(i) => Some(&i.tags),
            Self::Address(a) => Some(&a.tags),
            _ => None,
        }
    }

    /// Mutable resource-level tags, if the node carries any
    pub fn tags_mut(&mut self) -> Option<&mut Tags> {
        match self {
            Self::Bucket(b) => Some(&mut b.tags),
            Self::Role(r) => Some(&mut r.tags),
            Self::SecurityGroup(g) => Some(&mut g.tags),
            Self::Instance(i) => Some(&mut i.tags),
            Self::Address(a) => Some(&mut a.tags),
            _ => None,
        }
    }

    /// Teardown policy; only buckets are configurable
    pub fn removal_policy(&self) -> Option<RemovalPolicy> {
        match self {
            Self::Bucket(b) => Some(b.removal_policy),
            _ => None,
        }
    }
}
