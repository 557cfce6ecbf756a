use crate::condition::Condition;
use crate::constants::CONTAINERD_ADDRESS;
use crate::error::Result;
use crate::runner::process::ProcessRunner;
use crate::runner::restart::{Restart, RestartPolicy};
use crate::runner::{Args, Options, Runner};
use crate::service::Service;
use crate::services::{create_dirs, forever_backoff};
use async_trait::async_trait;
use userdata::UserData;

/// The container runtime every containerized service depends on.
pub struct Containerd;

#[async_trait]
impl Service for Containerd {
    fn id(&self, _data: &UserData) -> String {
        "containerd".to_string()
    }

    async fn pre(&self, _data: &UserData) -> Result<()> {
        create_dirs("containerd", ["/var/lib/containerd", "/run/containerd"]).await
    }

    fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
        None
    }

    fn runner(&self, data: &UserData) -> Result<Box<dyn Runner>> {
        let args = Args::new(
            self.id(data),
            vec![
                "/bin/containerd".to_string(),
                "--address".to_string(),
                CONTAINERD_ADDRESS.to_string(),
            ],
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
