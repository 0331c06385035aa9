//! Resource dependency graph
//!
//! Every declared resource is an explicit node keyed by its logical id.
//! Edges come from the references a node holds (typed references such as an
//! instance's security group, and `Ref`/`GetAtt` expressions) plus any explicit
//! dependencies. Synthesis walks the graph in topological order, so the order
//! in which a stack adds its nodes does not matter.

pub mod expr;
pub mod resources;

pub use expr::Expr;
pub use resources::{
    Address, AddressAssociation, AutoDeleteObjects, BlockPublicAccess, Bucket, BucketEncryption,
    Disk, Function, IngressRule, Instance, InstanceProfile, PolicyStatement, Protocol,
    RemovalPolicy, Resource, ResourceKind, Role, SecurityGroup, Tags, VolumeType, ANY_IPV4,
};

use crate::InfraError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Template-unique identifier of a node or parameter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// CloudFormation logical ids are alphanumeric and at most 255 chars
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 255
            && self.0.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl std::fmt::Display for LogicalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Template input parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub kind: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

/// A resource node plus its explicit dependencies
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub resource: Resource,
    pub depends_on: BTreeSet<LogicalId>,
}

/// Graph of resource nodes and template parameters
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<LogicalId, Node>,
    parameters: BTreeMap<LogicalId, Parameter>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; fails if the id is invalid or already taken
    pub fn add(&mut self, id: impl Into<String>, resource: Resource) -> Result<LogicalId, InfraError> {
        let id = LogicalId::new(id);
        self.check_new_id(&id)?;

        debug!("Declaring {} {}", resource.kind(), id);
        self.nodes.insert(
            id.clone(),
            Node {
                resource,
                depends_on: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    /// Add a template parameter
    pub fn add_parameter(
        &mut self,
        id: impl Into<String>,
        parameter: Parameter,
    ) -> Result<LogicalId, InfraError> {
        let id = LogicalId::new(id);
        self.check_new_id(&id)?;
        self.parameters.insert(id.clone(), parameter);
        Ok(id)
    }

    fn check_new_id(&self, id: &LogicalId) -> Result<(), InfraError> {
        if !id.is_valid() {
            return Err(InfraError::graph(format!("Invalid logical id '{}'", id)));
        }
        if self.nodes.contains_key(id) || self.parameters.contains_key(id) {
            return Err(InfraError::graph(format!("Duplicate logical id '{}'", id)));
        }
        Ok(())
    }

    /// Record that `from` must be created after `to`
    pub fn add_dependency(&mut self, from: &LogicalId, to: &LogicalId) -> Result<(), InfraError> {
        let node = self
            .nodes
            .get_mut(from)
            .ok_or_else(|| InfraError::graph(format!("Unknown node '{}'", from)))?;
        node.depends_on.insert(to.clone());
        Ok(())
    }

    pub fn get(&self, id: &LogicalId) -> Option<&Resource> {
        self.nodes.get(id).map(|n| &n.resource)
    }

    pub fn get_mut(&mut self, id: &LogicalId) -> Option<&mut Resource> {
        self.nodes.get_mut(id).map(|n| &mut n.resource)
    }

    /// Look up a node by its string id
    pub fn find(&self, id: &str) -> Option<&Resource> {
        self.get(&LogicalId::new(id))
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&LogicalId, &Parameter)> {
        self.parameters.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&LogicalId, &Resource)> {
        self.nodes.iter().map(|(id, n)| (id, &n.resource))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&LogicalId, &mut Resource)> {
        self.nodes.iter_mut().map(|(id, n)| (id, &mut n.resource))
    }

    /// Nodes of a given kind, in id order
    pub fn nodes_of_kind(&self, kind: ResourceKind) -> Vec<(&LogicalId, &Resource)> {
        self.nodes().filter(|(_, r)| r.kind() == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids `id` depends on
    pub fn dependencies(&self, id: &LogicalId) -> BTreeSet<LogicalId> {
        let Some(node) = self.nodes.get(id) else {
            return BTreeSet::new();
        };

        let mut deps: BTreeSet<LogicalId> = node.depends_on.clone();
        deps.extend(node.resource.typed_references().into_iter().map(|(r, _)| r.clone()));
        deps.extend(
            node.resource
                .expressions()
                .into_iter()
                .flat_map(|e| e.references())
                .filter(|r| self.nodes.contains_key(*r))
                .cloned(),
        );
        deps
    }

    /// Check references, reference kinds, disk ownership, bucket emptying
    /// handlers and acyclicity
    pub fn validate(&self) -> Result<(), InfraError> {
        let mut disk_owners: BTreeMap<&LogicalId, &LogicalId> = BTreeMap::new();
        let mut emptied: BTreeMap<&LogicalId, usize> = BTreeMap::new();

        for (id, node) in &self.nodes {
            if let Resource::Bucket(bucket) = &node.resource
                && bucket.removal_policy == RemovalPolicy::Retain
                && bucket.auto_delete_objects
            {
                return Err(InfraError::graph(format!(
                    "Bucket '{}' is retained on teardown but set to auto-delete its objects",
                    id
                )));
            }

            if let Resource::AutoDeleteObjects(handler) = &node.resource {
                *emptied.entry(&handler.bucket).or_default() += 1;
            }

            for (target, expected) in node.resource.typed_references() {
                let actual = self
                    .get(target)
                    .ok_or_else(|| {
                        InfraError::graph(format!("'{}' references unknown node '{}'", id, target))
                    })?
                    .kind();
                if actual != expected {
                    return Err(InfraError::graph(format!(
                        "'{}' expects '{}' to be a {}, found {}",
                        id, target, expected, actual
                    )));
                }
                if expected == ResourceKind::Disk
                    && let Some(owner) = disk_owners.insert(target, id)
                {
                    return Err(InfraError::graph(format!(
                        "Disk '{}' is attached to both '{}' and '{}'",
                        target, owner, id
                    )));
                }
            }

            for expr in node.resource.expressions() {
                for target in expr.references() {
                    if !self.nodes.contains_key(target) && !self.parameters.contains_key(target) {
                        return Err(InfraError::graph(format!(
                            "'{}' references unknown node or parameter '{}'",
                            id, target
                        )));
                    }
                }
            }

            for target in &node.depends_on {
                if !self.nodes.contains_key(target) {
                    return Err(InfraError::graph(format!(
                        "'{}' depends on unknown node '{}'",
                        id, target
                    )));
                }
            }
        }

        for (id, resource) in self.nodes_of_kind(ResourceKind::Bucket) {
            let Resource::Bucket(bucket) = resource else {
                continue;
            };
            let handlers = emptied.get(id).copied().unwrap_or(0);
            if bucket.auto_delete_objects && handlers != 1 {
                return Err(InfraError::graph(format!(
                    "Bucket '{}' auto-deletes its objects but has {} emptying handlers",
                    id, handlers
                )));
            }
            if !bucket.auto_delete_objects && handlers > 0 {
                return Err(InfraError::graph(format!(
                    "Bucket '{}' keeps its objects but has an emptying handler",
                    id
                )));
            }
        }

        for (id, _) in self.nodes_of_kind(ResourceKind::Disk) {
            if !disk_owners.contains_key(id) {
                return Err(InfraError::graph(format!(
                    "Disk '{}' is not attached to any instance",
                    id
                )));
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Node ids ordered so every node comes after its dependencies
    ///
    /// Ties are broken by logical id, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<LogicalId>, InfraError> {
        let mut remaining: BTreeMap<&LogicalId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<LogicalId, Vec<&LogicalId>> = BTreeMap::new();

        for id in self.nodes.keys() {
            let deps = self.dependencies(id);
            remaining.insert(id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut ready: VecDeque<&LogicalId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.clone());
            if let Some(children) = dependents.get(id) {
                let mut unlocked = Vec::new();
                for child in children {
                    if let Some(count) = remaining.get_mut(*child) {
                        *count -= 1;
                        if *count == 0 {
                            unlocked.push(*child);
                        }
                    }
                }
                unlocked.sort();
                ready.extend(unlocked);
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = remaining
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(InfraError::graph(format!(
                "Dependency cycle between: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(size: u32) -> Resource {
        Resource::Disk(Disk {
            device_name: "/dev/sdf".to_string(),
            size_gib: size,
            volume_type: VolumeType::Gp3,
            encrypted: true,
            delete_on_termination: true,
        })
    }

    fn instance(disks: Vec<LogicalId>) -> Resource {
        Resource::Instance(Instance {
            instance_type: "t3.large".to_string(),
            image: Expr::literal("ami-123"),
            security_group: LogicalId::new("Sg"),
            profile: LogicalId::new("Profile"),
            disks,
            subnet_id: None,
            user_data: None,
            tags: Tags::new(),
        })
    }

    fn base_graph() -> Graph {
        let mut graph = Graph::new();
        graph
            .add(
                "Sg",
                Resource::SecurityGroup(SecurityGroup {
                    description: "test".to_string(),
                    vpc_id: None,
                    allow_all_outbound: true,
                    tags: Tags::new(),
                }),
            )
            .unwrap();
        graph
            .add(
                "Role",
                Resource::Role(Role {
                    assumed_by: "ec2.amazonaws.com".to_string(),
                    description: None,
                    managed_policies: Vec::new(),
                    statements: Vec::new(),
                    tags: Tags::new(),
                }),
            )
            .unwrap();
        graph
            .add(
                "Profile",
                Resource::InstanceProfile(InstanceProfile {
                    role: LogicalId::new("Role"),
                }),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut graph = base_graph();
        let err = graph.add("Sg", disk(10)).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let mut graph = Graph::new();
        assert!(graph.add("bad-id", disk(10)).is_err());
        assert!(graph.add("", disk(10)).is_err());
    }

    #[test]
    fn test_topological_order_independent_of_insertion() {
        let mut graph = Graph::new();
        // Instance first, its dependencies afterwards
        graph.add("Instance", instance(vec![LogicalId::new("Data")])).unwrap();
        graph.add("Data", disk(100)).unwrap();
        let rest = base_graph();
        for (id, resource) in rest.nodes() {
            graph.add(id.as_str(), resource.clone()).unwrap();
        }

        graph.validate().unwrap();
        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|o| o.as_str() == id).unwrap();

        assert!(pos("Role") < pos("Profile"));
        assert!(pos("Profile") < pos("Instance"));
        assert!(pos("Sg") < pos("Instance"));
        assert!(pos("Data") < pos("Instance"));
    }

    #[test]
    fn test_unknown_reference() {
        let mut graph = Graph::new();
        graph
            .add(
                "Profile",
                Resource::InstanceProfile(InstanceProfile {
                    role: LogicalId::new("Missing"),
                }),
            )
            .unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("unknown node 'Missing'"));
    }

    #[test]
    fn test_wrong_reference_kind() {
        let mut graph = base_graph();
        graph
            .add(
                "Rule",
                Resource::Rule(IngressRule::tcp_from_anywhere(&LogicalId::new("Role"), 80, "http")),
            )
            .unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("expects 'Role' to be a security group"));
    }

    #[test]
    fn test_unattached_disk() {
        let mut graph = base_graph();
        graph.add("Orphan", disk(10)).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("not attached"));
    }

    #[test]
    fn test_disk_attached_twice() {
        let mut graph = base_graph();
        graph.add("Data", disk(10)).unwrap();
        graph.add("A", instance(vec![LogicalId::new("Data")])).unwrap();
        graph.add("B", instance(vec![LogicalId::new("Data")])).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("attached to both"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = base_graph();
        let sg = LogicalId::new("Sg");
        let role = LogicalId::new("Role");
        graph.add_dependency(&sg, &role).unwrap();
        graph.add_dependency(&role, &sg).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    fn auto_delete_bucket(graph: &mut Graph) -> LogicalId {
        graph
            .add(
                "Bucket",
                Resource::Bucket(Bucket {
                    versioned: true,
                    encryption: BucketEncryption::S3Managed,
                    block_public_access: BlockPublicAccess::BLOCK_ALL,
                    removal_policy: RemovalPolicy::Destroy,
                    auto_delete_objects: true,
                    tags: Tags::new(),
                }),
            )
            .unwrap()
    }

    fn add_handler(graph: &mut Graph, id: &str, bucket: &LogicalId) {
        let function = LogicalId::new(format!("{}Function", id));
        if graph.get(&function).is_none() {
            graph
                .add(
                    function.as_str(),
                    Resource::Function(Function {
                        role: LogicalId::new("Role"),
                        runtime: "python3.12".to_string(),
                        handler: "index.handler".to_string(),
                        source: "def handler(event, context): pass".to_string(),
                        timeout_seconds: 60,
                        description: None,
                    }),
                )
                .unwrap();
        }
        graph
            .add(
                id,
                Resource::AutoDeleteObjects(AutoDeleteObjects {
                    handler: function,
                    bucket: bucket.clone(),
                }),
            )
            .unwrap();
    }

    #[test]
    fn test_auto_delete_bucket_needs_handler() {
        let mut graph = base_graph();
        auto_delete_bucket(&mut graph);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("0 emptying handlers"));
    }

    #[test]
    fn test_auto_delete_handler_follows_bucket() {
        let mut graph = base_graph();
        let bucket = auto_delete_bucket(&mut graph);
        add_handler(&mut graph, "Emptier", &bucket);
        graph.validate().unwrap();

        let order = graph.topological_order().unwrap();
        let position = |id: &str| order.iter().position(|n| n.as_str() == id).unwrap();
        assert!(position("Bucket") < position("Emptier"));
        assert!(position("EmptierFunction") < position("Emptier"));
        assert!(position("Role") < position("EmptierFunction"));
    }

    #[test]
    fn test_second_handler_rejected() {
        let mut graph = base_graph();
        let bucket = auto_delete_bucket(&mut graph);
        add_handler(&mut graph, "Emptier", &bucket);
        add_handler(&mut graph, "Other", &bucket);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("2 emptying handlers"));
    }

    #[test]
    fn test_handler_on_kept_bucket_rejected() {
        let mut graph = base_graph();
        let bucket = auto_delete_bucket(&mut graph);
        if let Some(Resource::Bucket(b)) = graph.get_mut(&bucket) {
            b.auto_delete_objects = false;
        }
        add_handler(&mut graph, "Emptier", &bucket);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("keeps its objects"));
    }

    #[test]
    fn test_expression_may_reference_parameter() {
        let mut graph = base_graph();
        graph
            .add_parameter(
                "ImageId",
                Parameter {
                    kind: "String".to_string(),
                    default: None,
                    description: None,
                },
            )
            .unwrap();
        let mut node = instance(Vec::new());
        if let Resource::Instance(i) = &mut node {
            i.image = Expr::reference(&LogicalId::new("ImageId"));
        }
        graph.add("Instance", node).unwrap();
        graph.validate().unwrap();
        // Parameters are not graph dependencies
        assert!(!graph
            .dependencies(&LogicalId::new("Instance"))
            .contains(&LogicalId::new("ImageId")));
    }
}
