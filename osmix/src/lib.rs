//! In-memory OpenStreetMap toolkit: a columnar index over nodes, ways and
//! relations, a streaming PBF codec, geographic extraction, a merge /
//! changeset engine, and tile encoders reading straight from the index.
//!
//! The canonical pipeline is [`reader::read_pbf`] → a finalized [`Osm`] →
//! queries, [`extract::create_extract`], [`changeset::generate_changeset`]
//! + [`changeset::apply_changeset`], tile encoding, and
//! [`writer::write_pbf`] back out.

pub mod blob;
pub mod changeset;
pub mod extract;
pub mod ids;
pub mod model;
pub mod osm;
pub mod progress;
pub mod proto;
pub mod reader;
pub mod snapshot;
pub mod spatial;
pub mod store;
pub mod strings;
pub mod tags;
pub mod tiles;
pub mod writer;

pub use changeset::{apply_changeset, generate_changeset, Changeset, ChangesetOptions};
pub use extract::{create_extract, ExtractPolicy};
pub use model::{Entity, EntityType, Member, Node, Relation, Tags, Way};
pub use osm::{Osm, OsmHeader, OsmInfo};
pub use progress::{Progress, ProgressEvent, Severity};
pub use reader::{read_pbf, ReaderOptions};
pub use snapshot::OsmSnapshot;
pub use writer::{write_pbf, WriterOptions};
