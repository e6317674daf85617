use nalgebra::Point3;
use parking_lot::RwLock;
use std::sync::Arc;

/// Observer callback for engine diagnostics: a world position and a short
/// label, e.g. `("chunk (1, 0, 2)", saturation)`. Wired up by
/// [`Terrain::set_debug_sink`](crate::terrain::Terrain::set_debug_sink).
pub type DebugSink = Arc<dyn Fn(Point3<f32>, &str) + Send + Sync>;

/// Shared handle through which any part of the engine can emit diagnostics.
/// Cheap to clone and cheap to call when no sink is installed.
#[derive(Clone, Default)]
pub struct DebugEvents {
    sink: Arc<RwLock<Option<DebugSink>>>,
}

impl DebugEvents {
    pub fn set_sink(&self, sink: Option<DebugSink>) {
        *self.sink.write() = sink;
    }

    pub fn emit(&self, pos: Point3<f32>, label: &str) {
        if let Some(sink) = &*self.sink.read() {
            sink(pos, label);
        }
    }
}
