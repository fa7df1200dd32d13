use std::fmt::Debug;

use config::Source;

pub trait Config: Debug + Clone + Send + Sync + 'static {}

/// Layers user supplied sources on top of the reference configuration embedded in each crate.
pub trait ConfigBuilder: Sized {
    type C: Config;

    fn add_source<T>(self, source: T) -> anyhow::Result<Self>
    where
        T: Source + Send + Sync + 'static;

    fn build(self) -> anyhow::Result<Self::C>;
}
