//! Playback mix: per-peer spatial nodes merged through a master gain.
//!
//! Each spatial node owns a lock-free ring buffer. The producer half is
//! handed to whatever reads the remote track; the graph keeps the consumer
//! half and pulls from it in `render`.

use std::collections::HashMap;
use std::f32::consts::FRAC_PI_4;
use std::fmt;

use log::debug;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;

use super::GainParam;
use crate::error::VoiceError;

/// Identifier of a spatial node inside one graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Output context state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet unlocked by a user action
    Suspended,
    Running,
    Closed,
}

/// Audio output fed with mixed blocks (interleaved stereo f32)
pub trait PlaybackSink: Send {
    fn play(&mut self, block: &[f32]) -> Result<(), VoiceError>;
}

/// Write side of a spatial node (mono f32 samples)
pub struct NodeInput {
    node: NodeId,
    producer: ringbuf::HeapProd<f32>,
}

impl NodeInput {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Push decoded samples; returns how many fit.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }
}

struct SpatialNode {
    position: [f32; 3],
    connected: bool,
    input: Option<ringbuf::HeapProd<f32>>,
    output: ringbuf::HeapCons<f32>,
}

impl SpatialNode {
    /// Equal-power (left, right) weights from the node's x position.
    fn pan_weights(&self) -> (f32, f32) {
        let x = self.position[0];
        let pan = x / (x.abs() + 1.0);
        let angle = (pan + 1.0) * FRAC_PI_4;
        (angle.cos(), angle.sin())
    }
}

/// The shared playback mix
pub struct MixGraph {
    state: ContextState,
    master: GainParam,
    nodes: HashMap<NodeId, SpatialNode>,
    next_node: u64,
    /// Ring buffer capacity per node (samples)
    node_capacity: usize,
    scratch: Vec<f32>,
}

impl MixGraph {
    /// Create a suspended graph.
    ///
    /// # Arguments
    /// * `node_capacity` - Ring buffer size of each spatial node in samples
    pub fn new(node_capacity: usize) -> Self {
        Self {
            state: ContextState::Suspended,
            master: GainParam::new(1.0),
            nodes: HashMap::new(),
            next_node: 1,
            node_capacity: node_capacity.max(1),
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Unlock output. Fails once the context is closed.
    pub fn resume(&mut self) -> Result<(), VoiceError> {
        match self.state {
            ContextState::Closed => Err(VoiceError::Audio("audio context is closed".to_string())),
            _ => {
                self.state = ContextState::Running;
                Ok(())
            }
        }
    }

    /// Release the output context and every node. Terminal.
    pub fn close(&mut self) {
        self.nodes.clear();
        self.state = ContextState::Closed;
    }

    /// Master gain (deafen)
    pub fn master_gain(&self) -> &GainParam {
        &self.master
    }

    /// Create a new, unconnected spatial node at the origin.
    pub fn create_spatial_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;

        let (producer, consumer) = HeapRb::<f32>::new(self.node_capacity).split();
        self.nodes.insert(
            id,
            SpatialNode {
                position: [0.0; 3],
                connected: false,
                input: Some(producer),
                output: consumer,
            },
        );
        id
    }

    /// Connect a node into the mix. Returns false for unknown nodes.
    pub fn connect(&mut self, node: NodeId) -> bool {
        match self.nodes.get_mut(&node) {
            Some(n) => {
                n.connected = true;
                true
            }
            None => false,
        }
    }

    /// Disconnect a node from the mix. Returns false if it was not connected.
    pub fn disconnect(&mut self, node: NodeId) -> bool {
        match self.nodes.get_mut(&node) {
            Some(n) if n.connected => {
                n.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Discard a node and its buffer.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        self.nodes.remove(&node).is_some()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|n| n.connected).unwrap_or(false)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes currently feeding the mix
    pub fn connected_count(&self) -> usize {
        self.nodes.values().filter(|n| n.connected).count()
    }

    /// Take the write side of a node (only once per node).
    pub fn take_node_input(&mut self, node: NodeId) -> Option<NodeInput> {
        let producer = self.nodes.get_mut(&node)?.input.take()?;
        Some(NodeInput { node, producer })
    }

    /// Move a node; x < 0 pans left, x > 0 pans right.
    pub fn set_position(&mut self, node: NodeId, position: [f32; 3]) -> bool {
        match self.nodes.get_mut(&node) {
            Some(n) => {
                n.position = position;
                true
            }
            None => false,
        }
    }

    pub fn position(&self, node: NodeId) -> Option<[f32; 3]> {
        self.nodes.get(&node).map(|n| n.position)
    }

    /// Samples waiting in a node's buffer
    pub fn buffered(&self, node: NodeId) -> usize {
        self.nodes.get(&node).map(|n| n.output.occupied_len()).unwrap_or(0)
    }

    /// Mix every connected node into an interleaved stereo block.
    ///
    /// Outputs silence unless the context is running. Nodes that are
    /// disconnected keep their buffered samples.
    pub fn render(&mut self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        if self.state != ContextState::Running {
            return;
        }

        let frames = out.len() / 2;
        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0.0);
        }

        for (id, node) in self.nodes.iter_mut() {
            if !node.connected {
                continue;
            }
            let (left, right) = node.pan_weights();
            let scratch = &mut self.scratch[..frames];
            let read = node.output.pop_slice(scratch);
            if read < frames {
                debug!("[MixGraph] {} underrun ({} of {} frames)", id, read, frames);
            }
            for (frame, sample) in out.chunks_exact_mut(2).zip(scratch[..read].iter()) {
                frame[0] += sample * left;
                frame[1] += sample * right;
            }
        }

        self.master.apply(out);
    }
}
