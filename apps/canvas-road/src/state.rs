use std::sync::Arc;

use canvas_core::Canvas;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::session::SessionRegistry;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub canvas: Canvas,
    pub registry: SessionRegistry,
    pub metrics: PrometheusHandle,
    /// `None` disables the admin endpoints.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        canvas: Canvas,
        registry: SessionRegistry,
        metrics: PrometheusHandle,
        admin_token: Option<String>,
    ) -> SharedState {
        Arc::new(Self {
            canvas,
            registry,
            metrics,
            admin_token,
        })
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}
