/// Names of every store key and bus topic the canvas touches, under one
/// prefix so several canvases can share a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("canvas")
    }
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn pixels(&self) -> String {
        format!("{}:pixels", self.prefix)
    }

    pub fn placed(&self) -> String {
        format!("{}:placed", self.prefix)
    }

    pub fn snapshot(&self) -> String {
        format!("{}:snapshot", self.prefix)
    }

    pub fn heatmap(&self, window_hours: u32) -> String {
        format!("{}:heatmap:{}h", self.prefix, window_hours)
    }

    pub fn zone(&self, zx: u32, zy: u32) -> String {
        format!("{}:zone:{}:{}", self.prefix, zx, zy)
    }

    pub fn placements(&self) -> String {
        format!("{}:placements", self.prefix)
    }

    /// Present while a partial clear awaits re-initialization.
    pub fn inconsistent(&self) -> String {
        format!("{}:inconsistent", self.prefix)
    }

    pub fn updates_topic(&self) -> String {
        format!("{}:updates", self.prefix)
    }
}
