// Teardown sequencing
//
// Every Vulkan handle the renderer owns is registered here by kind. Each kind
// lists the kinds it was created against; the destruction order is derived
// from those edges instead of being written out by hand, and every release is
// checked against the live set so a dependent can never outlive its parent.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// A class of owned Vulkan handles.
///
/// Variant order is the preferred destruction order; the graph follows it
/// wherever the dependency edges leave a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    CommandBuffers,
    FrameSync,
    CommandPool,
    RenderPass,
    Framebuffers,
    ImageViews,
    Swapchain,
    Pipeline,
    PipelineCache,
    PipelineLayout,
    VertexBuffer,
    VertexMemory,
    Device,
    DebugMessenger,
    Surface,
    Instance,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 16] = [
        Self::CommandBuffers,
        Self::FrameSync,
        Self::CommandPool,
        Self::RenderPass,
        Self::Framebuffers,
        Self::ImageViews,
        Self::Swapchain,
        Self::Pipeline,
        Self::PipelineCache,
        Self::PipelineLayout,
        Self::VertexBuffer,
        Self::VertexMemory,
        Self::Device,
        Self::DebugMessenger,
        Self::Surface,
        Self::Instance,
    ];

    /// Everything that has to be recreated when the swapchain goes stale.
    pub const SWAPCHAIN_DEPENDENT: [ResourceKind; 10] = [
        Self::CommandBuffers,
        Self::FrameSync,
        Self::CommandPool,
        Self::RenderPass,
        Self::Framebuffers,
        Self::ImageViews,
        Self::Swapchain,
        Self::Pipeline,
        Self::PipelineCache,
        Self::PipelineLayout,
    ];

    /// Kinds this one was created against and must not outlive.
    pub fn dependencies(self) -> &'static [ResourceKind] {
        use ResourceKind::*;
        match self {
            Instance => &[],
            DebugMessenger => &[Instance],
            Surface => &[Instance],
            // The surface has to outlive the device.
            Device => &[Instance, Surface],
            Swapchain => &[Device, Surface],
            ImageViews => &[Device, Swapchain],
            RenderPass => &[Device],
            // A render pass only has to outlive the command buffers that
            // use it; framebuffers and pipelines are merely created against it.
            Framebuffers => &[Device, ImageViews],
            PipelineLayout => &[Device],
            PipelineCache => &[Device],
            Pipeline => &[Device, PipelineLayout, PipelineCache],
            VertexMemory => &[Device],
            VertexBuffer => &[Device, VertexMemory],
            CommandPool => &[Device],
            FrameSync => &[Device],
            CommandBuffers => &[CommandPool, RenderPass, Framebuffers, Pipeline, VertexBuffer],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TeardownError {
    #[error("cannot destroy {resource}: {dependent} still references it")]
    StillReferenced {
        resource: ResourceKind,
        dependent: ResourceKind,
    },

    #[error("{0} is not live")]
    NotLive(ResourceKind),

    #[error("dependency cycle among {0:?}")]
    Cycle(Vec<ResourceKind>),
}

/// Live-resource ledger and destruction planner.
#[derive(Debug, Default, Clone)]
pub struct ResourceGraph {
    live: BTreeSet<ResourceKind>,
}

impl ResourceGraph {
    /// Record a freshly created resource.
    pub fn insert(&mut self, kind: ResourceKind) {
        if !self.live.insert(kind) {
            log::warn!("{} registered twice", kind);
        }
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.live.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// First live resource still referencing `kind`, if any.
    fn live_dependent(&self, kind: ResourceKind) -> Option<ResourceKind> {
        self.live
            .iter()
            .copied()
            .find(|other| other.dependencies().contains(&kind))
    }

    /// Remove `kind` from the live set, refusing while anything still depends on it.
    pub fn release(&mut self, kind: ResourceKind) -> Result<(), TeardownError> {
        if !self.live.contains(&kind) {
            return Err(TeardownError::NotLive(kind));
        }
        if let Some(dependent) = self.live_dependent(kind) {
            return Err(TeardownError::StillReferenced {
                resource: kind,
                dependent,
            });
        }
        self.live.remove(&kind);
        Ok(())
    }

    /// Order in which every live resource can be destroyed.
    pub fn destruction_order(&self) -> Result<Vec<ResourceKind>, TeardownError> {
        let all: Vec<_> = self.live.iter().copied().collect();
        self.release_order(&all)
    }

    /// Order in which `subset` can be destroyed while the rest stays alive.
    ///
    /// Kinds in `subset` that are not live are ignored. Fails if a live
    /// resource outside the subset depends on one inside it.
    pub fn release_order(&self, subset: &[ResourceKind]) -> Result<Vec<ResourceKind>, TeardownError> {
        let mut pending: BTreeSet<ResourceKind> = subset
            .iter()
            .copied()
            .filter(|kind| self.live.contains(kind))
            .collect();

        for &kind in &pending {
            if let Some(outsider) = self
                .live
                .iter()
                .copied()
                .filter(|other| !pending.contains(other))
                .find(|other| other.dependencies().contains(&kind))
            {
                return Err(TeardownError::StillReferenced {
                    resource: kind,
                    dependent: outsider,
                });
            }
        }

        // Kahn's algorithm on the reversed edges: a resource is ready once no
        // pending resource depends on it. BTreeSet iteration gives the
        // declaration-order tie-break.
        let mut order = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .copied()
                .find(|&kind| !pending.iter().any(|other| other.dependencies().contains(&kind)));

            match ready {
                Some(kind) => {
                    pending.remove(&kind);
                    order.push(kind);
                }
                None => return Err(TeardownError::Cycle(pending.into_iter().collect())),
            }
        }

        Ok(order)
    }
}

impl FromIterator<ResourceKind> for ResourceGraph {
    fn from_iter<I: IntoIterator<Item = ResourceKind>>(iter: I) -> Self {
        Self {
            live: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[ResourceKind], kind: ResourceKind) -> usize {
        order.iter().position(|&k| k == kind).unwrap()
    }

    #[test]
    fn full_order_destroys_dependents_first() {
        let graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        let order = graph.destruction_order().unwrap();

        assert_eq!(order.len(), ResourceKind::ALL.len());
        for &kind in &order {
            for &dep in kind.dependencies() {
                assert!(
                    position(&order, kind) < position(&order, dep),
                    "{kind} must be destroyed before {dep}"
                );
            }
        }
    }

    #[test]
    fn full_order_follows_listed_sequence() {
        let graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        let order = graph.destruction_order().unwrap();

        use ResourceKind::*;
        assert_eq!(
            order,
            vec![
                CommandBuffers,
                FrameSync,
                CommandPool,
                RenderPass,
                Framebuffers,
                ImageViews,
                Swapchain,
                Pipeline,
                PipelineCache,
                PipelineLayout,
                VertexBuffer,
                VertexMemory,
                Device,
                DebugMessenger,
                Surface,
                Instance,
            ]
        );
    }

    #[test]
    fn releasing_in_listed_order_never_fails() {
        let mut graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        for kind in ResourceKind::ALL {
            assert_eq!(graph.release(kind), Ok(()), "releasing {kind}");
        }
        assert!(graph.is_empty());
    }

    #[test]
    fn render_pass_waits_only_for_command_buffers() {
        let mut graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        assert_eq!(
            graph.release(ResourceKind::RenderPass),
            Err(TeardownError::StillReferenced {
                resource: ResourceKind::RenderPass,
                dependent: ResourceKind::CommandBuffers,
            })
        );

        graph.release(ResourceKind::CommandBuffers).unwrap();
        graph.release(ResourceKind::RenderPass).unwrap();
        assert!(graph.contains(ResourceKind::Framebuffers));
        assert!(graph.contains(ResourceKind::Pipeline));
    }

    #[test]
    fn releasing_in_derived_order_never_fails() {
        let mut graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        for kind in graph.destruction_order().unwrap() {
            graph.release(kind).unwrap();
        }
        assert!(graph.is_empty());
    }

    #[test]
    fn device_before_swapchain_is_rejected() {
        let mut graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        for kind in [
            ResourceKind::CommandBuffers,
            ResourceKind::Framebuffers,
            ResourceKind::ImageViews,
        ] {
            graph.release(kind).unwrap();
        }

        let err = graph.release(ResourceKind::Device).unwrap_err();
        assert!(matches!(
            err,
            TeardownError::StillReferenced {
                resource: ResourceKind::Device,
                ..
            }
        ));
        assert!(graph.contains(ResourceKind::Device));

        let mut minimal: ResourceGraph = [
            ResourceKind::Instance,
            ResourceKind::Surface,
            ResourceKind::Device,
            ResourceKind::Swapchain,
        ]
        .into_iter()
        .collect();
        assert_eq!(
            minimal.release(ResourceKind::Device),
            Err(TeardownError::StillReferenced {
                resource: ResourceKind::Device,
                dependent: ResourceKind::Swapchain,
            })
        );
    }

    #[test]
    fn double_release_is_rejected() {
        let mut graph: ResourceGraph = [ResourceKind::Instance].into_iter().collect();
        graph.release(ResourceKind::Instance).unwrap();
        assert_eq!(
            graph.release(ResourceKind::Instance),
            Err(TeardownError::NotLive(ResourceKind::Instance))
        );
    }

    #[test]
    fn optional_debug_messenger_is_skipped() {
        let graph: ResourceGraph = ResourceKind::ALL
            .into_iter()
            .filter(|&k| k != ResourceKind::DebugMessenger)
            .collect();
        let order = graph.destruction_order().unwrap();
        assert!(!order.contains(&ResourceKind::DebugMessenger));
        assert_eq!(order.last(), Some(&ResourceKind::Instance));
    }

    #[test]
    fn swapchain_subset_leaves_device_context_alive() {
        let mut graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        let order = graph.release_order(&ResourceKind::SWAPCHAIN_DEPENDENT).unwrap();
        assert_eq!(order.len(), ResourceKind::SWAPCHAIN_DEPENDENT.len());

        for kind in order {
            graph.release(kind).unwrap();
        }
        for kind in [
            ResourceKind::Instance,
            ResourceKind::Surface,
            ResourceKind::Device,
            ResourceKind::VertexBuffer,
            ResourceKind::VertexMemory,
        ] {
            assert!(graph.contains(kind));
        }
    }

    #[test]
    fn subset_with_outside_dependent_is_rejected() {
        let graph: ResourceGraph = ResourceKind::ALL.into_iter().collect();
        let err = graph.release_order(&[ResourceKind::VertexBuffer]).unwrap_err();
        assert_eq!(
            err,
            TeardownError::StillReferenced {
                resource: ResourceKind::VertexBuffer,
                dependent: ResourceKind::CommandBuffers,
            }
        );
    }
}
