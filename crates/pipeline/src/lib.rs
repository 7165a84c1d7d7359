//! `capline-pipeline` — Processing graphs and the frame dispatcher.
//!
//! - [`graph`] — filter graph description parser, filter nodes, and
//!   [`FilterGraph`] (one per media kind)
//! - [`dispatcher`] — [`Dispatcher`], which pumps frames from any number of
//!   producers through the graphs into a single consumer
//!
//! ## Usage
//!
//! ```ignore
//! use capline_pipeline::Dispatcher;
//!
//! let mut dispatcher = Dispatcher::new(PipelineConfig::default());
//! dispatcher.append(source)?;
//! dispatcher.set_consumer(encoder)?;
//! dispatcher.create_filter_graph("scale=1280:720", "volume=-3dB")?;
//! dispatcher.start()?;
//! // ...
//! dispatcher.stop();
//! ```

pub mod dispatcher;
pub mod graph;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use graph::{parse_graph, Filter, FilterGraph, FilterSpec};
