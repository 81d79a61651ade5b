// src/graph.rs
//
// An instrument's DSP graph: `Module`s wired by input index, evaluated
// depth-first from a single output node. Each node is either `Global` (one
// shared instance) or `PerVoice` (one instance per active voice, mixed
// together before the node is considered "evaluated").
//
// Input buffers are copied into owned scratch storage before a node's
// `process` call rather than borrowed directly from `self.buffers`: with
// recursive depth-first evaluation over a `Vec<NodeBuffer>` indexed by
// node id, borrowing an arbitrary earlier buffer immutably while the
// current one is borrowed mutably isn't expressible without unsafe, and a
// DSP graph's buffers are small enough that the copy is not a concern.

use crate::{
    audio_buffer::AudioBuffer,
    module::{Module, Polyphony, ProcessContext},
    module_registry::ModuleFactory,
    voice_allocator::VoiceAllocator,
};

pub struct NodeBuffer {
    pub channels: usize,
    pub data: Vec<f32>,
    pub temp_voice: Vec<f32>,
}

impl NodeBuffer {
    pub fn new(channels: usize, max_block: usize) -> Self {
        let size = channels * max_block;
        Self {
            channels,
            data: vec![0.0; size],
            temp_voice: vec![0.0; size],
        }
    }
}

pub enum NodeInstance {
    Global(Box<dyn Module>),
    PerVoice(Vec<Box<dyn Module>>),
}

impl NodeInstance {
    #[inline]
    pub fn set_param(&mut self, param_id: u32, value: f32) {
        match self {
            NodeInstance::Global(module) => module.set_param(param_id, value),
            NodeInstance::PerVoice(modules) => {
                for module in modules.iter_mut() {
                    module.set_param(param_id, value);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        match self {
            NodeInstance::Global(module) => module.reset(),
            NodeInstance::PerVoice(modules) => modules.iter_mut().for_each(|m| m.reset()),
        }
    }
}

pub struct GraphNode {
    pub instance: NodeInstance,
    pub inputs: Vec<usize>,
    pub silent: bool,
}

/// The per-instrument audio graph.
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub buffers: Vec<NodeBuffer>,
    pub output_node: usize,
    pub max_block: usize,
    pub max_voices: usize,
    sample_rate: f64,
}

impl Graph {
    pub fn new(max_block: usize, max_voices: usize) -> Self {
        Self {
            nodes: Vec::new(),
            buffers: Vec::new(),
            output_node: 0,
            max_block,
            max_voices,
            sample_rate: 48_000.0,
        }
    }

    /// Adds a node, returning its index.
    pub fn add_node(&mut self, factory: &dyn ModuleFactory) -> usize {
        let channels = factory.num_channels();

        let instance = match factory.polyphony() {
            Polyphony::Global => NodeInstance::Global(factory.create()),
            Polyphony::PerVoice => {
                let nodes = (0..self.max_voices).map(|_| factory.create()).collect();
                NodeInstance::PerVoice(nodes)
            }
        };

        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            instance,
            inputs: Vec::new(),
            silent: false,
        });
        self.buffers.push(NodeBuffer::new(channels, self.max_block));
        idx
    }

    pub fn connect(&mut self, src: usize, dst: usize) {
        self.nodes[dst].inputs.push(src);
    }

    pub fn set_output_node(&mut self, idx: usize) {
        self.output_node = idx;
    }

    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for (node, buf) in self.nodes.iter_mut().zip(&mut self.buffers) {
            match &mut node.instance {
                NodeInstance::Global(n) => n.prepare(sample_rate, self.max_block),
                NodeInstance::PerVoice(nodes) => {
                    for n in nodes {
                        n.prepare(sample_rate, self.max_block);
                    }
                }
            }
            node.silent = false;
            buf.data.fill(0.0);
            buf.temp_voice.fill(0.0);
        }
    }

    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.instance.reset();
        }
    }

    /// Evaluates the graph for one block, returning whether the final
    /// output node reported silence.
    pub fn process_block(&mut self, frames: usize, sample_pos: u64, bpm: f64, voices: &VoiceAllocator) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        self.eval_node(self.output_node, frames, sample_pos, bpm, voices)
    }

    fn eval_node(&mut self, idx: usize, frames: usize, sample_pos: u64, bpm: f64, voices: &VoiceAllocator) -> bool {
        let input_indices = self.nodes[idx].inputs.clone();

        let mut input_owned: Vec<(usize, Vec<f32>)> = Vec::with_capacity(input_indices.len());
        for src in input_indices {
            let silent = self.eval_node(src, frames, sample_pos, bpm, voices);
            if !silent {
                let channels = self.buffers[src].channels;
                let data = self.buffers[src].data[..channels * frames].to_vec();
                input_owned.push((channels, data));
            }
        }

        let input_buffers: Vec<AudioBuffer> = input_owned
            .iter_mut()
            .map(|(channels, data)| AudioBuffer {
                channels: *channels,
                frames,
                data: data.as_mut_slice(),
            })
            .collect();
        let input_refs: Vec<&AudioBuffer> = input_buffers.iter().collect();

        let base_ctx = ProcessContext::new(frames, self.sample_rate, sample_pos, bpm);
        let node = &mut self.nodes[idx];
        let buf = &mut self.buffers[idx];

        let mut output = AudioBuffer {
            channels: buf.channels,
            frames,
            data: &mut buf.data[..buf.channels * frames],
        };
        output.clear();

        let silent = match &mut node.instance {
            NodeInstance::Global(n) => n.process(&base_ctx, &input_refs, &mut output),
            NodeInstance::PerVoice(nodes) => {
                let mut all_silent = true;
                for voice in voices.active_voices() {
                    let vn = &mut nodes[voice.id];
                    let ctx = base_ctx.with_voice(voice);

                    let mut voice_buf = AudioBuffer {
                        channels: buf.channels,
                        frames,
                        data: &mut buf.temp_voice[..buf.channels * frames],
                    };
                    voice_buf.clear();

                    let voice_silent = vn.process(&ctx, &input_refs, &mut voice_buf);
                    if !voice_silent {
                        all_silent = false;
                        mix_add(&voice_buf, &mut output);
                    }
                }
                all_silent
            }
        };

        node.silent = silent;
        silent
    }

    pub fn set_param(&mut self, param_id: u32, value: f32) {
        for node in &mut self.nodes {
            node.instance.set_param(param_id, value);
        }
    }

    /// The output node's rendered samples from the most recent
    /// `process_block` call, planar by channel.
    pub fn output(&self) -> &[f32] {
        self.buffers.get(self.output_node).map(|b| b.data.as_slice()).unwrap_or(&[])
    }

    pub fn output_channels(&self) -> usize {
        self.buffers.get(self.output_node).map(|b| b.channels).unwrap_or(0)
    }
}

fn mix_add(src: &AudioBuffer, dst: &mut AudioBuffer) {
    for ch in 0..dst.channels {
        for (d, s) in dst.channel_mut(ch).iter_mut().zip(src.channel(ch)) {
            *d += s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_registry::SimpleModuleFactory;

    struct ConstGain(f32);
    impl Module for ConstGain {
        fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}
        fn process(&mut self, _ctx: &ProcessContext, inputs: &[&AudioBuffer], output: &mut AudioBuffer) -> bool {
            if inputs.is_empty() {
                for ch in 0..output.channels {
                    for s in output.channel_mut(ch).iter_mut() {
                        *s = self.0;
                    }
                }
                return self.0 == 0.0;
            }
            for ch in 0..output.channels {
                for (d, s) in output.channel_mut(ch).iter_mut().zip(inputs[0].channel(ch)) {
                    *d = s * self.0;
                }
            }
            false
        }
        fn num_channels(&self) -> usize {
            2
        }
        fn set_param(&mut self, _param_id: u32, _value: f32) {}
    }

    #[test]
    fn single_node_graph_processes() {
        let mut graph = Graph::new(64, 4);
        let factory = SimpleModuleFactory::new(|| Box::new(ConstGain(0.5)), Polyphony::Global);
        let idx = graph.add_node(&factory);
        graph.set_output_node(idx);
        graph.prepare(48_000.0);

        let voices = VoiceAllocator::new(4);
        let silent = graph.process_block(32, 0, 120.0, &voices);
        assert!(!silent);
        assert_eq!(graph.buffers[idx].data[0], 0.5);
    }
}
