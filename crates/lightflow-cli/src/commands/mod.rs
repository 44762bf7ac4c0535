//! Subcommand implementations

pub mod config;
pub mod worker;
pub mod workflow;

use lightflow::config::ConfigError;
use lightflow::queue::QueueError;
use lightflow::sched::SchedulerError;
use lightflow::signal::SignalError;
use lightflow::spec::SpecError;
use lightflow::store::StoreError;

/// Map an error chain to the documented exit codes
///
/// 1 user/config error, 2 broker/store unreachable, 3 unknown workflow.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(spec) = cause.downcast_ref::<SpecError>() {
            if matches!(spec, SpecError::WorkflowNotFound(_)) {
                return 3;
            }
        }
        if let Some(sched) = cause.downcast_ref::<SchedulerError>() {
            match sched {
                SchedulerError::Spec(SpecError::WorkflowNotFound(_)) => return 3,
                SchedulerError::Queue(QueueError::Unavailable(_))
                | SchedulerError::Store(StoreError::Unavailable(_))
                | SchedulerError::Signal(SignalError::Unavailable(_))
                | SchedulerError::Signal(SignalError::Timeout(_)) => return 2,
                _ => {}
            }
        }
        if matches!(cause.downcast_ref::<QueueError>(), Some(QueueError::Unavailable(_)))
            || matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::Unavailable(_)))
            || matches!(
                cause.downcast_ref::<SignalError>(),
                Some(SignalError::Unavailable(_) | SignalError::Timeout(_))
            )
        {
            return 2;
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 1;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightflow::config::Config;

    #[test]
    fn test_unknown_workflow_is_exit_3() {
        let err = anyhow::Error::new(SpecError::WorkflowNotFound("ghost".to_string()));
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_unreachable_broker_is_exit_2() {
        let err = anyhow::Error::new(QueueError::Unavailable("connection refused".to_string()));
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_config_error_is_exit_1() {
        let err = Config::load(std::path::Path::new("/nope/lightflow.cfg")).unwrap_err();
        assert_eq!(exit_code(&anyhow::Error::new(err)), 1);
    }
}
