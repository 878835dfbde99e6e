use crate::control_plane::{ControlPlane, NodeDescriptor, NodeType};
use crate::error::CollectorError;
use crate::measurement::ServiceModel;

/// Ask the control plane for its connected nodes, once. An empty list is a
/// startup failure.
pub async fn discover(control_plane: &dyn ControlPlane) -> Result<Vec<NodeDescriptor>, CollectorError> {
    let nodes = control_plane.list_connected_nodes().await?;
    if nodes.is_empty() {
        return Err(CollectorError::NoNodes);
    }

    tracing::info!(count = nodes.len(), "Connected E2 nodes");
    for node in &nodes {
        let functions: Vec<String> = node
            .ran_functions
            .iter()
            .map(|id| match ServiceModel::from_ran_function_id(*id) {
                Some(model) => model.to_string(),
                None => id.to_string(),
            })
            .collect();
        tracing::info!(
            node = %node.id,
            node_type = %node.node_type,
            ran_functions = %functions.join(", "),
            "Discovered node"
        );
    }
    Ok(nodes)
}

/// Keep the nodes whose type is in `wanted`, preserving discovery order.
pub fn select_nodes(nodes: &[NodeDescriptor], wanted: &[NodeType]) -> Vec<NodeDescriptor> {
    nodes
        .iter()
        .filter(|node| {
            let keep = wanted.contains(&node.node_type);
            if !keep {
                tracing::debug!(node = %node.id, node_type = %node.node_type, "Node type not collected");
            }
            keep
        })
        .cloned()
        .collect()
}
