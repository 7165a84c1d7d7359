//! Per-media-kind processing graph.
//!
//! A [`FilterGraph`] is built from a textual description (see [`parser`]),
//! has one input per producer of its media kind and exactly one output
//! toward the consumer:
//!
//! ```text
//!   [in0] ──▶ hflip ──▶ scale ──┐
//!                               ├──▶ overlay ──▶ [out] ──▶ pull()
//!   [in1] ─────────────────────-┘
//! ```
//!
//! Frames are pushed into an input, flow synchronously through the nodes,
//! and queue at the output until [`FilterGraph::pull`] takes them. Nothing
//! blocks: the dispatcher decides how fast to push and pull.

pub mod audio;
pub mod filter;
pub mod hw;
pub mod parser;
pub mod video;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use capline_common::{
    Frame, FramesContext, MediaError, MediaKind, MediaResult, StreamFormat,
};
use capline_gpu_hal::{DeviceBinding, DeviceContext, FramesSource};
use tracing::{debug, warn};

pub use filter::{create, Filter, Passthrough};
pub use parser::{parse_graph, Chain, FilterArg, FilterSpec};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Target {
    Node { node: usize, pad: usize },
    Sink,
}

enum Event {
    Frame(Frame),
    End,
}

struct Node {
    filter: Box<dyn Filter>,
    ended: Vec<bool>,
    done: bool,
    output: Target,
}

struct InputPad {
    target: Target,
    ended: bool,
}

/// Where a pad was found while linking: an output (`from`) or input (`to`).
#[derive(Default)]
struct LabelUse {
    from: Vec<usize>,
    to: Vec<Target>,
}

/// Graph input index named by `[in]` / `[inN]`.
fn input_label(label: &str) -> Option<usize> {
    match label.strip_prefix("in")? {
        "" => Some(0),
        digits if digits.bytes().all(|c| c.is_ascii_digit()) => digits.parse().ok(),
        _ => None,
    }
}

pub struct FilterGraph {
    kind: MediaKind,
    description: String,
    nodes: Vec<Node>,
    inputs: Vec<InputPad>,
    sink: VecDeque<Frame>,
    sink_ended: bool,
}

impl FilterGraph {
    /// Build a graph of `kind` with `num_inputs` producer inputs.
    ///
    /// An empty description is a pass-through; with several audio inputs it
    /// becomes an `amix` of all of them.
    pub fn build(kind: MediaKind, description: &str, num_inputs: usize) -> MediaResult<Self> {
        if num_inputs == 0 {
            return Err(MediaError::NoProducer(kind));
        }
        let description = description.trim();
        let description = if description.is_empty() {
            match (kind, num_inputs) {
                (MediaKind::Video, 1) => "null".to_string(),
                (MediaKind::Audio, 1) => "anull".to_string(),
                (MediaKind::Audio, n) => format!("amix=inputs={n}"),
                (MediaKind::Video, n) => {
                    return Err(MediaError::graph_parse(format!(
                        "{n} video inputs need an explicit graph description"
                    )))
                }
            }
        } else {
            description.to_string()
        };

        let chains = parse_graph(&description)?;
        let mut graph = Self {
            kind,
            description,
            nodes: Vec::new(),
            inputs: Vec::new(),
            sink: VecDeque::new(),
            sink_ended: false,
        };
        graph.link(&chains, num_inputs)?;
        debug!(
            kind = %kind,
            inputs = num_inputs,
            nodes = graph.nodes.len(),
            description = %graph.description,
            "Built filter graph"
        );
        Ok(graph)
    }

    fn link(&mut self, chains: &[Chain], num_inputs: usize) -> MediaResult<()> {
        let mut labels: HashMap<String, LabelUse> = HashMap::new();
        let mut open_inputs: Vec<Target> = Vec::new();
        let mut open_outputs: Vec<usize> = Vec::new();

        for chain in chains {
            let mut previous: Option<usize> = None;
            for (position, spec) in chain.iter().enumerate() {
                let filter = create(self.kind, spec)?;
                let node = self.nodes.len();
                let pads = filter.num_inputs();
                if spec.inputs.len() > pads {
                    return Err(MediaError::graph_parse(format!(
                        "'{}' takes {pads} input(s), {} labelled",
                        spec.name,
                        spec.inputs.len()
                    )));
                }
                if spec.outputs.len() > 1 {
                    return Err(MediaError::graph_parse(format!(
                        "'{}' has a single output, {} labelled",
                        spec.name,
                        spec.outputs.len()
                    )));
                }

                for (pad, label) in spec.inputs.iter().enumerate() {
                    labels
                        .entry(label.clone())
                        .or_default()
                        .to
                        .push(Target::Node { node, pad });
                }
                let mut free = spec.inputs.len()..pads;
                if let Some(prev) = previous {
                    let pad = free.next().ok_or_else(|| {
                        MediaError::graph_parse(format!(
                            "'{}' has no free input for the previous filter",
                            spec.name
                        ))
                    })?;
                    self.nodes[prev].output = Target::Node { node, pad };
                }
                open_inputs.extend(free.map(|pad| Target::Node { node, pad }));

                self.nodes.push(Node {
                    filter,
                    ended: vec![false; pads],
                    done: false,
                    output: Target::Sink,
                });

                let last = position + 1 == chain.len();
                match spec.outputs.first() {
                    Some(label) => {
                        labels.entry(label.clone()).or_default().from.push(node);
                        if !last {
                            return Err(MediaError::graph_parse(format!(
                                "output [{label}] of '{}' is followed by another filter",
                                spec.name
                            )));
                        }
                        previous = None;
                    }
                    None if last => open_outputs.push(node),
                    None => previous = Some(node),
                }
            }
        }

        let mut bound: Vec<Option<Target>> = vec![None; num_inputs];
        let mut sink_feeds = open_outputs.clone();

        for (label, uses) in &labels {
            if label == "out" {
                if !uses.to.is_empty() {
                    return Err(MediaError::graph_parse("[out] cannot feed a filter"));
                }
                sink_feeds.extend(&uses.from);
                continue;
            }
            if let Some(index) = input_label(label) {
                if !uses.from.is_empty() {
                    return Err(MediaError::graph_parse(format!("[{label}] is a graph input")));
                }
                if index >= num_inputs {
                    return Err(MediaError::graph_parse(format!(
                        "[{label}] has no producer ({num_inputs} available)"
                    )));
                }
                match uses.to.as_slice() {
                    [target] if bound[index].is_none() => bound[index] = Some(*target),
                    _ => {
                        return Err(MediaError::graph_parse(format!(
                            "[{label}] is connected more than once"
                        )))
                    }
                }
                continue;
            }
            match (uses.from.as_slice(), uses.to.as_slice()) {
                ([from], [to]) => self.nodes[*from].output = *to,
                ([], _) | (_, []) => {
                    return Err(MediaError::graph_parse(format!("pad [{label}] is not connected")))
                }
                _ => {
                    return Err(MediaError::graph_parse(format!(
                        "pad [{label}] is used more than once"
                    )))
                }
            }
        }

        // Unlabelled inputs take the producers not named explicitly.
        let mut free_slots = bound.iter_mut().filter(|slot| slot.is_none());
        for target in open_inputs {
            let slot = free_slots.next().ok_or_else(|| {
                MediaError::graph_parse(format!(
                    "graph has more inputs than the {num_inputs} producer(s)"
                ))
            })?;
            *slot = Some(target);
        }

        self.inputs = bound
            .into_iter()
            .enumerate()
            .map(|(index, target)| {
                target
                    .map(|target| InputPad {
                        target,
                        ended: false,
                    })
                    .ok_or_else(|| {
                        MediaError::graph_parse(format!("producer input [in{index}] is not connected"))
                    })
            })
            .collect::<MediaResult<_>>()?;

        match sink_feeds.as_slice() {
            [node] => self.nodes[*node].output = Target::Sink,
            [] => return Err(MediaError::graph_parse("graph has no output")),
            _ => return Err(MediaError::graph_parse("graph has more than one output")),
        }

        // Following outputs from any node must reach the sink; a loop never does.
        for start in 0..self.nodes.len() {
            let mut at = self.nodes[start].output;
            let mut steps = 0;
            while let Target::Node { node, .. } = at {
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(MediaError::graph_parse("graph contains a cycle"));
                }
                at = self.nodes[node].output;
            }
        }
        Ok(())
    }

    /// Insert conversion nodes so the output matches what the consumer wants.
    ///
    /// Video gets a pixel format conversion (hardware surfaces pass); audio
    /// gets channel remixing and resampling.
    pub fn adapt_output(&mut self, format: &StreamFormat) {
        let mut adapters: Vec<Box<dyn Filter>> = Vec::new();
        match format {
            StreamFormat::Video { format, .. } if !format.is_hardware() => {
                adapters.push(Box::new(video::FormatFilter::new(*format).passing_hardware()));
            }
            StreamFormat::Video { .. } => {}
            StreamFormat::Audio {
                sample_rate,
                channels,
                ..
            } => {
                adapters.push(Box::new(audio::AFormat::new(*channels)));
                adapters.push(Box::new(audio::AResample::new(*sample_rate)));
            }
        }
        for filter in adapters {
            self.append(filter);
        }
    }

    /// Put `filter` between the current last node and the sink.
    fn append(&mut self, filter: Box<dyn Filter>) {
        let node = self.nodes.len();
        if let Some(last) = self.nodes.iter_mut().find(|n| n.output == Target::Sink) {
            last.output = Target::Node { node, pad: 0 };
        }
        let pads = filter.num_inputs();
        self.nodes.push(Node {
            filter,
            ended: vec![false; pads],
            done: false,
            output: Target::Sink,
        });
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Filter names in creation order.
    pub fn node_names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.filter.name()).collect()
    }

    /// Whether any node needs a hardware device.
    pub fn needs_device(&self) -> bool {
        self.nodes.iter().any(|n| n.filter.name() == "hwupload")
    }

    /// Feed one frame into producer input `input`.
    pub fn push(&mut self, input: usize, frame: Frame) -> MediaResult<()> {
        if frame.kind() != self.kind {
            return Err(MediaError::InvalidArgument(format!(
                "{} frame pushed into {} graph",
                frame.kind(),
                self.kind
            )));
        }
        let pad = self
            .inputs
            .get(input)
            .ok_or_else(|| MediaError::InvalidArgument(format!("graph has no input {input}")))?;
        if pad.ended {
            return Ok(());
        }
        let target = pad.target;
        self.deliver(target, Event::Frame(frame))
    }

    /// Producer input `input` reached end of stream.
    pub fn end_input(&mut self, input: usize) -> MediaResult<()> {
        let Some(pad) = self.inputs.get_mut(input) else {
            return Err(MediaError::InvalidArgument(format!("graph has no input {input}")));
        };
        if pad.ended {
            return Ok(());
        }
        pad.ended = true;
        let target = pad.target;
        self.deliver(target, Event::End)
    }

    pub fn input_ended(&self, input: usize) -> bool {
        self.inputs.get(input).map_or(true, |p| p.ended)
    }

    fn deliver(&mut self, start: Target, event: Event) -> MediaResult<()> {
        let mut work = VecDeque::from([(start, event)]);
        let mut first_error = None;
        while let Some((target, event)) = work.pop_front() {
            let (node_index, pad) = match target {
                Target::Sink => {
                    match event {
                        Event::Frame(frame) if !self.sink_ended => self.sink.push_back(frame),
                        Event::Frame(_) => {}
                        Event::End => self.sink_ended = true,
                    }
                    continue;
                }
                Target::Node { node, pad } => (node, pad),
            };
            let node = &mut self.nodes[node_index];
            if node.done {
                continue;
            }
            let mut out = Vec::new();
            let result = match event {
                Event::Frame(frame) => node.filter.filter(pad, frame, &mut out),
                Event::End if node.ended[pad] => Ok(()),
                Event::End => {
                    node.ended[pad] = true;
                    node.filter.end(pad, &mut out)
                }
            };
            if let Err(err) = result {
                warn!(filter = node.filter.name(), error = %err, "Filter failed");
                first_error.get_or_insert(err);
            }
            let next = node.output;
            work.extend(out.into_iter().map(|f| (next, Event::Frame(f))));
            if node.filter.is_done(&node.ended) {
                node.done = true;
                work.push_back((next, Event::End));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Next frame at the output, if any.
    pub fn pull(&mut self) -> Option<Frame> {
        self.sink.pop_front()
    }

    /// Drop everything queued at the output. Returns how many frames went.
    pub fn discard_output(&mut self) -> usize {
        let n = self.sink.len();
        self.sink.clear();
        n
    }

    /// Frames queued at the output.
    pub fn pending(&self) -> usize {
        self.sink.len()
    }

    /// Every input ended and the output has been drained.
    pub fn is_finished(&self) -> bool {
        self.sink_ended && self.sink.is_empty()
    }
}

impl DeviceBinding for FilterGraph {
    fn bind_device(&mut self, device: &Arc<DeviceContext>) -> usize {
        self.nodes
            .iter_mut()
            .filter_map(|n| n.filter.bind_device(device).then_some(()))
            .count()
    }
}

impl FramesSource for FilterGraph {
    fn output_frames_context(&self) -> Option<Arc<FramesContext>> {
        self.nodes
            .iter()
            .rev()
            .find_map(|n| n.filter.output_frames_context())
    }
}

impl std::fmt::Debug for FilterGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterGraph")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .field("nodes", &self.node_names())
            .field("inputs", &self.inputs.len())
            .field("pending", &self.sink.len())
            .finish()
    }
}
