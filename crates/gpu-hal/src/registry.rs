//! Hardware device registry.
//!
//! One registry is owned per capture/playback session and handed by
//! reference to whatever needs device binding. It creates at most one
//! [`DeviceContext`] per [`DeviceType`] and keeps the frames context
//! captured from a processing graph so the encoder can reuse it.
//!
//! Ordering between graph setup and encoder setup is the caller's job:
//!
//! ```ignore
//! let dev = registry.find_or_create(DeviceType::Vaapi)?;
//! registry.bind_to_graph(&mut graph, DeviceType::Vaapi)?;
//! // ... run the graph until its sink has produced a frame ...
//! registry.bind_frames_context(&graph, DeviceType::Vaapi)?;
//! registry.setup_for_encoding(&mut encoder_hw, DeviceType::Vaapi)?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use capline_common::{DeviceType, FramesContext, MediaError, MediaResult};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::probe::{PlatformProbe, SystemProbe};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to an opened acceleration device.
///
/// Cloning the surrounding `Arc` is the only way it is shared; the context
/// itself is never mutated after creation.
#[derive(Debug)]
pub struct DeviceContext {
    id: u64,
    device: DeviceType,
    node: String,
    created: Instant,
}

impl DeviceContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device
    }

    /// Backing node (render node path or driver handle name).
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }
}

/// Something that owns graph nodes able to use a device.
pub trait DeviceBinding {
    /// Attach `device` to every node. Returns how many nodes took it.
    fn bind_device(&mut self, device: &Arc<DeviceContext>) -> usize;
}

/// Something whose output lives in device memory.
pub trait FramesSource {
    /// The frames context of the output, once known.
    fn output_frames_context(&self) -> Option<Arc<FramesContext>>;
}

/// Device state the encoder needs for hardware surfaces.
#[derive(Debug, Default, Clone)]
pub struct EncoderHwState {
    pub device: Option<Arc<DeviceContext>>,
    pub frames: Option<Arc<FramesContext>>,
}

impl EncoderHwState {
    pub fn is_configured(&self) -> bool {
        self.device.is_some() && self.frames.is_some()
    }
}

/// Row of [`DeviceRegistry::list_devices`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device: DeviceType,
    pub node: Option<String>,
    pub opened: bool,
}

struct Entry {
    ctx: Arc<DeviceContext>,
    frames: Option<Arc<FramesContext>>,
}

/// Owned registry of acceleration devices.
pub struct DeviceRegistry {
    probe: Box<dyn PlatformProbe>,
    entries: Mutex<Vec<Entry>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(SystemProbe)
    }
}

impl DeviceRegistry {
    pub fn new(probe: impl PlatformProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn is_supported(&self, device: DeviceType) -> bool {
        self.probe.supported().contains(&device)
    }

    /// Every device type, whether the platform supports it, and whether it
    /// has been opened.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let entries = self.entries.lock();
        DeviceType::ALL
            .into_iter()
            .map(|device| DeviceInfo {
                device,
                node: self.probe.node(device),
                opened: entries.iter().any(|e| e.ctx.device == device),
            })
            .collect()
    }

    /// Return the context for `device`, creating it on first use.
    pub fn find_or_create(&self, device: DeviceType) -> MediaResult<Arc<DeviceContext>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter().find(|e| e.ctx.device == device) {
            debug!(device = %device, id = entry.ctx.id, "Reusing hardware device");
            return Ok(Arc::clone(&entry.ctx));
        }

        if !self.probe.supported().contains(&device) {
            return Err(MediaError::DeviceUnsupported(device.name().to_string()));
        }
        let node = self
            .probe
            .node(device)
            .ok_or_else(|| MediaError::DeviceUnsupported(device.name().to_string()))?;

        let ctx = Arc::new(DeviceContext {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            device,
            node,
            created: Instant::now(),
        });
        info!(device = %device, node = %ctx.node, id = ctx.id, "Created hardware device");
        entries.push(Entry {
            ctx: Arc::clone(&ctx),
            frames: None,
        });
        Ok(ctx)
    }

    /// Lookup by name (`"vaapi"`, `"cuda"`, ...).
    pub fn find_or_create_by_name(&self, name: &str) -> MediaResult<Arc<DeviceContext>> {
        let device = DeviceType::from_name(name)
            .ok_or_else(|| MediaError::DeviceUnsupported(name.to_string()))?;
        self.find_or_create(device)
    }

    /// Attach the device of type `device` to every node of `graph`.
    pub fn bind_to_graph<G: DeviceBinding + ?Sized>(
        &self,
        graph: &mut G,
        device: DeviceType,
    ) -> MediaResult<usize> {
        let ctx = self.find_or_create(device)?;
        let bound = graph.bind_device(&ctx);
        debug!(device = %device, nodes = bound, "Bound device into graph");
        Ok(bound)
    }

    /// Capture the output frames context of `node` for later encoder setup.
    pub fn bind_frames_context<S: FramesSource + ?Sized>(
        &self,
        node: &S,
        device: DeviceType,
    ) -> MediaResult<Arc<FramesContext>> {
        let frames = node.output_frames_context().ok_or_else(|| {
            MediaError::NotReady(format!("{device} graph output has no frames context"))
        })?;
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.ctx.device == device)
            .ok_or_else(|| MediaError::NotReady(format!("{device} device was never created")))?;
        entry.frames = Some(Arc::clone(&frames));
        debug!(device = %device, frames_id = frames.id, "Captured frames context");
        Ok(frames)
    }

    pub fn frames_context(&self, device: DeviceType) -> Option<Arc<FramesContext>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.ctx.device == device)
            .and_then(|e| e.frames.clone())
    }

    /// Hand the device and its captured frames context to the encoder.
    ///
    /// Fails with `NotReady` until a graph has run and
    /// [`bind_frames_context`](Self::bind_frames_context) captured its output.
    pub fn setup_for_encoding(
        &self,
        state: &mut EncoderHwState,
        device: DeviceType,
    ) -> MediaResult<()> {
        let entries = self.entries.lock();
        let entry = entries
            .iter()
            .find(|e| e.ctx.device == device)
            .ok_or_else(|| MediaError::NotReady(format!("{device} device was never created")))?;
        let frames = entry.frames.clone().ok_or_else(|| {
            MediaError::NotReady(format!("{device} frames context not captured yet"))
        })?;
        state.device = Some(Arc::clone(&entry.ctx));
        state.frames = Some(frames);
        info!(device = %device, "Encoder bound to hardware frames");
        Ok(())
    }

    /// Number of opened devices.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop the registry's references. Handles held elsewhere stay valid.
    pub fn release_all(&self) {
        let released = std::mem::take(&mut *self.entries.lock());
        if !released.is_empty() {
            debug!(count = released.len(), "Released hardware devices");
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        let opened: Vec<DeviceType> = entries.iter().map(|e| e.ctx.device).collect();
        f.debug_struct("DeviceRegistry")
            .field("opened", &opened)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use capline_common::PixelFormat;

    struct FakeGraph {
        nodes: Vec<Option<Arc<DeviceContext>>>,
        output: Option<Arc<FramesContext>>,
    }

    impl DeviceBinding for FakeGraph {
        fn bind_device(&mut self, device: &Arc<DeviceContext>) -> usize {
            for node in &mut self.nodes {
                *node = Some(Arc::clone(device));
            }
            self.nodes.len()
        }
    }

    impl FramesSource for FakeGraph {
        fn output_frames_context(&self) -> Option<Arc<FramesContext>> {
            self.output.clone()
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(StaticProbe::new([DeviceType::Vaapi, DeviceType::Cuda]))
    }

    #[test]
    fn find_or_create_shares_handle() {
        let reg = registry();
        let a = reg.find_or_create(DeviceType::Vaapi).unwrap();
        let b = reg.find_or_create(DeviceType::Vaapi).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);

        let c = reg.find_or_create_by_name("cuda").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unsupported_device_fails() {
        let reg = registry();
        let err = reg.find_or_create(DeviceType::Qsv).unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnsupported(_)));
        assert!(reg.is_empty());
        assert!(matches!(
            reg.find_or_create_by_name("opencl"),
            Err(MediaError::DeviceUnsupported(_))
        ));
    }

    #[test]
    fn bind_to_graph_reaches_every_node() {
        let reg = registry();
        let mut graph = FakeGraph {
            nodes: vec![None, None, None],
            output: None,
        };
        assert_eq!(reg.bind_to_graph(&mut graph, DeviceType::Vaapi).unwrap(), 3);
        let dev = reg.find_or_create(DeviceType::Vaapi).unwrap();
        for node in &graph.nodes {
            assert!(Arc::ptr_eq(node.as_ref().unwrap(), &dev));
        }
    }

    #[test]
    fn setup_for_encoding_requires_frames_context() {
        let reg = registry();
        let mut state = EncoderHwState::default();

        assert!(matches!(
            reg.setup_for_encoding(&mut state, DeviceType::Vaapi),
            Err(MediaError::NotReady(_))
        ));

        reg.find_or_create(DeviceType::Vaapi).unwrap();
        assert!(matches!(
            reg.setup_for_encoding(&mut state, DeviceType::Vaapi),
            Err(MediaError::NotReady(_))
        ));
        assert!(!state.is_configured());

        let graph = FakeGraph {
            nodes: vec![],
            output: Some(Arc::new(FramesContext::new(
                DeviceType::Vaapi,
                PixelFormat::Nv12,
                1280,
                720,
            ))),
        };
        let frames = reg.bind_frames_context(&graph, DeviceType::Vaapi).unwrap();
        reg.setup_for_encoding(&mut state, DeviceType::Vaapi).unwrap();
        assert!(state.is_configured());
        assert_eq!(state.frames.as_ref().unwrap().id, frames.id);
    }

    #[test]
    fn bind_frames_context_without_output_is_not_ready() {
        let reg = registry();
        reg.find_or_create(DeviceType::Cuda).unwrap();
        let graph = FakeGraph {
            nodes: vec![],
            output: None,
        };
        assert!(matches!(
            reg.bind_frames_context(&graph, DeviceType::Cuda),
            Err(MediaError::NotReady(_))
        ));
    }

    #[test]
    fn list_and_release() {
        let reg = registry();
        reg.find_or_create(DeviceType::Cuda).unwrap();
        let listed = reg.list_devices();
        assert_eq!(listed.len(), DeviceType::ALL.len());
        let cuda = listed.iter().find(|d| d.device == DeviceType::Cuda).unwrap();
        assert!(cuda.opened);
        assert!(cuda.node.is_some());
        let qsv = listed.iter().find(|d| d.device == DeviceType::Qsv).unwrap();
        assert!(!qsv.opened && qsv.node.is_none());

        let held = reg.find_or_create(DeviceType::Cuda).unwrap();
        reg.release_all();
        assert!(reg.is_empty());
        assert_eq!(held.device_type(), DeviceType::Cuda);
        assert!(serde_json::to_string(&listed).unwrap().contains("\"cuda\""));
    }
}
