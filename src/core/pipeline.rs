//! Pipeline descriptors.
//!
//! A pipeline is an explicit, ordered list of [`Stage`]s bound to a mount.
//! The gateway drives every pipeline with the same loop, so ordering and
//! short-circuiting are visible here rather than hidden in nested handlers.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    core::{plugin::PluginRecord, proxy::LoadBalancingProxyClient, router},
    ports::{interceptor::InterceptPoint, service::Service},
};

/// Kind of pipeline a mount resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Service,
    Proxy,
    StaticResource,
}

/// Identity of a mounted pipeline, attached to each exchange it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineInfo {
    pub kind: PipelineKind,
    pub uri_prefix: String,
    pub name: String,
}

impl PipelineInfo {
    /// `uri_prefix` is stored in the same form the router matches on.
    pub fn new(kind: PipelineKind, uri_prefix: &str, name: impl Into<String>) -> Self {
        Self {
            kind,
            uri_prefix: router::normalize(uri_prefix),
            name: name.into(),
        }
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InjectPipelineInfo,
    LogRequest,
    Cors,
    PoweredBy,
    Interceptors(InterceptPoint),
    Security,
    /// Strip client credentials before they can reach an upstream.
    RemoveAuthHeaders,
    /// Tell the upstream who the caller is.
    InjectForwardedHeaders,
    Handle,
}

/// What finally produces the response.
#[derive(Clone)]
pub enum PipelineHandler {
    Service(PluginRecord<dyn Service>),
    Proxy(Arc<LoadBalancingProxyClient>),
    StaticResource { root: String, welcome_file: String },
}

impl std::fmt::Debug for PipelineHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineHandler::Service(record) => write!(f, "Service({})", record.name()),
            PipelineHandler::Proxy(client) => write!(f, "Proxy({})", client.name()),
            PipelineHandler::StaticResource { root, .. } => write!(f, "StaticResource({root})"),
        }
    }
}

/// A mounted pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    info: Arc<PipelineInfo>,
    secured: bool,
    stages: Vec<Stage>,
    handler: PipelineHandler,
}

impl Pipeline {
    /// Service pipelines answer locally and carry CORS headers.
    pub fn service(info: PipelineInfo, secured: bool, service: PluginRecord<dyn Service>) -> Self {
        Self {
            info: Arc::new(info),
            secured,
            stages: vec![
                Stage::InjectPipelineInfo,
                Stage::LogRequest,
                Stage::Cors,
                Stage::PoweredBy,
                Stage::Interceptors(InterceptPoint::RequestBeforeAuth),
                Stage::Security,
                Stage::Interceptors(InterceptPoint::RequestAfterAuth),
                Stage::Handle,
                Stage::Interceptors(InterceptPoint::Response),
            ],
            handler: PipelineHandler::Service(service),
        }
    }

    pub fn proxy(info: PipelineInfo, secured: bool, client: Arc<LoadBalancingProxyClient>) -> Self {
        Self {
            info: Arc::new(info),
            secured,
            stages: vec![
                Stage::InjectPipelineInfo,
                Stage::LogRequest,
                Stage::PoweredBy,
                Stage::Interceptors(InterceptPoint::RequestBeforeAuth),
                Stage::Security,
                Stage::RemoveAuthHeaders,
                Stage::InjectForwardedHeaders,
                Stage::Interceptors(InterceptPoint::RequestAfterAuth),
                Stage::Handle,
                Stage::Interceptors(InterceptPoint::Response),
            ],
            handler: PipelineHandler::Proxy(client),
        }
    }

    pub fn static_resource(
        info: PipelineInfo,
        secured: bool,
        root: impl Into<String>,
        welcome_file: impl Into<String>,
    ) -> Self {
        Self {
            info: Arc::new(info),
            secured,
            stages: vec![
                Stage::InjectPipelineInfo,
                Stage::LogRequest,
                Stage::Security,
                Stage::Handle,
            ],
            handler: PipelineHandler::StaticResource {
                root: root.into(),
                welcome_file: welcome_file.into(),
            },
        }
    }

    pub fn info(&self) -> &Arc<PipelineInfo> {
        &self.info
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn handler(&self) -> &PipelineHandler {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(stages: &[Stage], stage: Stage) -> usize {
        stages.iter().position(|s| *s == stage).unwrap()
    }

    #[test]
    fn test_prefix_is_stored_normalized() {
        assert_eq!(PipelineInfo::new(PipelineKind::Proxy, "/api/", "api").uri_prefix, "/api");
        assert_eq!(PipelineInfo::new(PipelineKind::Service, "//", "root").uri_prefix, "/");
    }

    #[test]
    fn test_static_pipeline_has_no_interceptor_points() {
        let pipeline = Pipeline::static_resource(
            PipelineInfo::new(PipelineKind::StaticResource, "/assets", "assets"),
            false,
            "./public",
            "index.html",
        );
        assert!(
            !pipeline
                .stages()
                .iter()
                .any(|s| matches!(s, Stage::Interceptors(_)))
        );
        assert_eq!(pipeline.stages().last(), Some(&Stage::Handle));
    }

    #[test]
    fn test_stage_order_around_security() {
        let stages = [
            Stage::InjectPipelineInfo,
            Stage::LogRequest,
            Stage::PoweredBy,
            Stage::Interceptors(InterceptPoint::RequestBeforeAuth),
            Stage::Security,
            Stage::RemoveAuthHeaders,
            Stage::InjectForwardedHeaders,
            Stage::Interceptors(InterceptPoint::RequestAfterAuth),
            Stage::Handle,
            Stage::Interceptors(InterceptPoint::Response),
        ];
        let before = position(&stages, Stage::Interceptors(InterceptPoint::RequestBeforeAuth));
        let security = position(&stages, Stage::Security);
        let after = position(&stages, Stage::Interceptors(InterceptPoint::RequestAfterAuth));
        let handle = position(&stages, Stage::Handle);
        assert!(before < security && security < after && after < handle);
    }
}
