// src/compile.rs
//
// Compiles a declarative GraphDef into a runtime Graph. This is the bridge
// a control-side builder (or the FFI/wasm surface) uses to describe an
// Instrument's DSP chain by module-type id rather than by constructing
// `Graph` nodes directly in Rust, the way `scene::Instrument` does for
// code built inline.

use std::collections::HashMap;

use crate::graph::Graph;
use crate::module_registry::ModuleRegistry;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub source_node: NodeId,
    pub dest_node: NodeId,
}

#[derive(Debug, Clone, Default)]
pub struct NodeDef {
    pub type_id: u32,
    pub param_values: HashMap<u32, f32>,
}

/// Declarative description of an Instrument's DSP graph: nodes by module
/// type id, connections between them, and an output node. Built on the
/// control thread, then handed to [`compile`] to produce a runtime `Graph`.
#[derive(Debug, Clone, Default)]
pub struct GraphDef {
    pub nodes: HashMap<NodeId, NodeDef>,
    pub connections: Vec<Connection>,
    pub output_node: Option<NodeId>,
    next_id: NodeId,
}

impl GraphDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, type_id: u32) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, NodeDef { type_id, param_values: HashMap::new() });
        id
    }

    pub fn connect(&mut self, source_node: NodeId, dest_node: NodeId) {
        self.connections.push(Connection { source_node, dest_node });
    }

    pub fn set_param(&mut self, node: NodeId, param_id: u32, value: f32) {
        if let Some(def) = self.nodes.get_mut(&node) {
            def.param_values.insert(param_id, value);
        }
    }
}

#[derive(Debug)]
pub enum CompileError {
    UnknownModuleType { node_id: NodeId, type_id: u32 },
    InvalidConnection { source: NodeId, dest: NodeId },
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnknownModuleType { node_id, type_id } => {
                write!(f, "node {node_id} has unknown module type {type_id}")
            }
            CompileError::InvalidConnection { source, dest } => {
                write!(f, "invalid connection from {source} to {dest}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

/// Compiles `def` into a runtime `Graph`: instantiates every node from
/// `registry`, applies its recorded parameter values, wires connections,
/// and sets the output node. The returned graph still needs `prepare`
/// before it can process audio.
pub fn compile(def: &GraphDef, registry: &ModuleRegistry, max_block: usize, max_voices: usize) -> CompileResult<Graph> {
    let mut graph = Graph::new(max_block, max_voices);
    let mut id_to_index: HashMap<NodeId, usize> = HashMap::new();

    let mut node_ids: Vec<NodeId> = def.nodes.keys().copied().collect();
    node_ids.sort();

    for &node_id in &node_ids {
        let node_def = &def.nodes[&node_id];
        let factory = registry
            .factory(node_def.type_id)
            .ok_or(CompileError::UnknownModuleType { node_id, type_id: node_def.type_id })?;

        let idx = graph.add_node(factory);
        id_to_index.insert(node_id, idx);

        for (&param_id, &value) in &node_def.param_values {
            graph.nodes[idx].instance.set_param(param_id, value);
        }
    }

    for conn in &def.connections {
        let &src_idx = id_to_index
            .get(&conn.source_node)
            .ok_or(CompileError::InvalidConnection { source: conn.source_node, dest: conn.dest_node })?;
        let &dst_idx = id_to_index
            .get(&conn.dest_node)
            .ok_or(CompileError::InvalidConnection { source: conn.source_node, dest: conn.dest_node })?;
        graph.connect(src_idx, dst_idx);
    }

    if let Some(output_id) = def.output_node {
        if let Some(&idx) = id_to_index.get(&output_id) {
            graph.set_output_node(idx);
        }
    } else if !node_ids.is_empty() {
        graph.set_output_node(graph.nodes.len() - 1);
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::AudioBuffer;
    use crate::module::{Module, Polyphony, ProcessContext};
    use crate::module_registry::{ModuleTypeInfo, SimpleModuleFactory};

    struct TestModule;
    impl Module for TestModule {
        fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}
        fn process(&mut self, _ctx: &ProcessContext, _inputs: &[&AudioBuffer], _output: &mut AudioBuffer) -> bool {
            true
        }
        fn num_channels(&self) -> usize {
            1
        }
        fn set_param(&mut self, _param_id: u32, _value: f32) {}
    }

    #[test]
    fn compile_empty_graph_succeeds() {
        let def = GraphDef::new();
        let registry = ModuleRegistry::new();
        assert!(compile(&def, &registry, 512, 8).is_ok());
    }

    #[test]
    fn compile_wires_connections_and_output() {
        const TEST_TYPE: u32 = 1;
        let mut def = GraphDef::new();
        let osc = def.add_node(TEST_TYPE);
        let out = def.add_node(TEST_TYPE);
        def.connect(osc, out);
        def.output_node = Some(out);

        let mut registry = ModuleRegistry::new();
        registry.register(
            ModuleTypeInfo::new(TEST_TYPE, "Test", "Test"),
            SimpleModuleFactory::new(|| Box::new(TestModule), Polyphony::Global),
        );

        let graph = compile(&def, &registry, 512, 8).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].inputs.len(), 1);
    }

    #[test]
    fn compile_rejects_unknown_module_type() {
        let mut def = GraphDef::new();
        def.add_node(999);
        let registry = ModuleRegistry::new();
        assert!(matches!(compile(&def, &registry, 512, 8), Err(CompileError::UnknownModuleType { .. })));
    }
}
