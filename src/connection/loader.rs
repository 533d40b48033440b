//! Program loader contract
//!
//! A program loader puts firmware on a target device before the transports
//! that talk to it connect. Loaders are provided by the application; the
//! manager only decides which ones run and how their failures count.

use crate::error::Result;
use crate::transport::ConnectionLog;
use async_trait::async_trait;

/// Load progress in percent
pub type ProgressCallback = dyn Fn(f32) + Send + Sync;

#[async_trait]
pub trait ProgramLoader: Send + Sync {
    fn id(&self) -> &str;

    /// Device the program is for; `None` for loaders not tied to a device
    fn device_id(&self) -> Option<&str> {
        None
    }

    /// A failing optional loader never fails a connect
    fn is_optional(&self) -> bool {
        false
    }

    /// Load the program
    ///
    /// Without `force` the loader may skip work, e.g. when the program was
    /// already loaded once.
    async fn load_program(
        &self,
        log: &dyn ConnectionLog,
        progress: Option<&ProgressCallback>,
        force: bool,
    ) -> Result<()>;
}

/// Device id of a loader, with blank ids treated as none
pub(crate) fn device_of(loader: &dyn ProgramLoader) -> Option<&str> {
    loader.device_id().filter(|id| !id.is_empty())
}

/// Loaders grouped by device, in first-seen order, with the `""` group first
pub(crate) struct LoaderBuckets<L> {
    buckets: Vec<(String, Vec<L>)>,
}

impl<L> LoaderBuckets<L> {
    pub fn new() -> Self {
        Self {
            buckets: vec![(String::new(), Vec::new())],
        }
    }

    pub fn push(&mut self, device_id: &str, loader: L) {
        match self.buckets.iter_mut().find(|(id, _)| *id == device_id) {
            Some((_, loaders)) => loaders.push(loader),
            None => self.buckets.push((device_id.to_string(), vec![loader])),
        }
    }

    pub fn in_order(self) -> impl Iterator<Item = (String, L)> {
        self.buckets
            .into_iter()
            .flat_map(|(device, loaders)| loaders.into_iter().map(move |l| (device.clone(), l)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_keep_first_seen_order() {
        let mut buckets = LoaderBuckets::new();
        buckets.push("cc", 1);
        buckets.push("msp", 2);
        buckets.push("", 3);
        buckets.push("cc", 4);

        let order: Vec<_> = buckets.in_order().collect();
        assert_eq!(
            order,
            vec![
                (String::new(), 3),
                ("cc".to_string(), 1),
                ("cc".to_string(), 4),
                ("msp".to_string(), 2)
            ]
        );
    }
}
