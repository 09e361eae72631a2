//! A streaming anomaly-detection and imputation engine built on an ensemble
//! of random cut trees.
//!
//! Each tree maintains a random binary space partition over a time-decayed
//! sample of the stream; the forest fans every update out to its trees and
//! folds visitor traversals back into scores or imputed values. Points live
//! once, in a reference-counted [`PointStore`](pointstore::PointStore)
//! shared by all trees, which also performs internal shingling of
//! time-series inputs and serializes to a compact portable state.
//!
//! ```ignore
//! use cutforest::RandomCutForest;
//!
//! let mut forest = RandomCutForest::builder(2)
//!     .sample_size(256)
//!     .number_of_trees(50)
//!     .random_seed(7)
//!     .build()?;
//!
//! for point in data {
//!     forest.update(&point)?;
//! }
//! let score = forest.score(&[0.1, -0.4])?;
//! let filled = forest.impute(&[0.1, f64::NAN])?;
//! ```
//!
//! ### References
//!
//! Sudipto Guha, Nina Mishra, Gourav Roy, and Okke Schrijvers. *"Robust
//! random cut forest based anomaly detection on streams."* International
//! Conference on Machine Learning, pp. 2712-2721. PMLR, 2016.

pub mod boundingbox;
pub mod component;
pub mod cut;
pub mod errors;
pub mod executor;
pub mod forest;
pub mod imputevisitor;
mod intervalstore;
mod nodestore;
pub mod nodeview;
pub mod pointstore;
pub mod sampler;
pub mod scorevisitor;
pub mod statemapper;
pub mod tree;
pub mod types;
mod util;
pub mod visitor;

pub use boundingbox::BoundingBox;
pub use component::{ForestComponent, UpdateResult};
pub use cut::Cut;
pub use errors::ForestError;
pub use executor::{ConvergingAccumulator, ConvergingMean, ForestExecutor};
pub use forest::{ForestBuilder, RandomCutForest};
pub use imputevisitor::{Imputation, ImputeVisitor};
pub use nodeview::NodeView;
pub use pointstore::PointStore;
pub use sampler::{ReservoirSampler, SamplerDecision, TimeDecaySampler};
pub use scorevisitor::AnomalyScoreVisitor;
pub use statemapper::{to_model, to_state, PointStoreState};
pub use tree::RandomCutTree;
pub use types::{PointHandle, RandomUnit, Result, ScriptedRandom, SeededRandom, SequenceIndex};
pub use visitor::{MultiVisitor, Visitor};
