use crate::condition::Condition;
use crate::error::Result;
use crate::runner::process::ProcessRunner;
use crate::runner::restart::{Restart, RestartPolicy};
use crate::runner::{Args, Options, Runner};
use crate::service::Service;
use crate::services::forever_backoff;
use async_trait::async_trait;
use userdata::UserData;

/// Device manager.
pub struct Udevd;

#[async_trait]
impl Service for Udevd {
    fn id(&self, _data: &UserData) -> String {
        "udevd".to_string()
    }

    async fn pre(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }

    fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
        None
    }

    fn runner(&self, data: &UserData) -> Result<Box<dyn Runner>> {
        let args = Args::new(
            self.id(data),
            vec!["/sbin/udevd".to_string(), "--resolve-names=never".to_string()],
        );

        let runner = ProcessRunner::new(args, Options::default());
        Ok(Box::new(
            Restart::new(Box::new(runner), RestartPolicy::Forever).with_backoff(forever_backoff()),
        ))
    }

    async fn post(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }
}
