//! The persistent canvas data model: shared immutable trees of layers,
//! groups and props, their exclusively owned transient counterparts, the
//! id-to-path route index, and tile-level diffing between snapshots.

pub mod annotations;
pub mod diff;
pub mod layer_content;
pub mod layer_list;
pub mod layer_props;
pub mod routes;
pub mod state;
pub mod view_mode;

pub use annotations::{Annotation, AnnotationList, DocumentMetadata};
pub use diff::CanvasDiff;
pub use layer_content::{LayerContent, Sublayer};
pub use layer_list::{LayerGroup, LayerList, LayerListEntry};
pub use layer_props::{LayerProps, LayerPropsList};
pub use routes::{LayerRoute, LayerRoutes};
pub use state::{CanvasState, TransientCanvasState};
pub use view_mode::{ViewMode, ViewModeFilter};
