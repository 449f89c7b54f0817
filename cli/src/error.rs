use drover_harness::HarnessError;
use thiserror::Error;

/// Failures that belong to the command line rather than the harness
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0} metric(s) outside their historic bounds")]
    BoundsViolated(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::BoundsViolated(_) => 6,
            CliError::InvalidArgument(_) => 2,
        }
    }
}

pub fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<HarnessError>() {
        return e.exit_code();
    }
    if let Some(e) = error.downcast_ref::<CliError>() {
        return e.exit_code();
    }
    1
}

pub fn format_error(error: &anyhow::Error) -> String {
    let hint = match error.downcast_ref::<HarnessError>() {
        Some(HarnessError::Config(_)) => {
            Some("Try running 'droverctl config show' to check your configuration.")
        }
        Some(HarnessError::Launch { .. }) => {
            Some("Check that the host is reachable and the benchmark program is installed.")
        }
        Some(HarnessError::StartTimeout { .. }) => {
            Some("The cluster never reported a start after the trigger; check that the change was deployed.")
        }
        Some(e) if e.phase().is_some() && e.elapsed().is_some() => {
            Some("The remote process or operation may still be running.")
        }
        _ => None,
    };

    let mut message = format!("Error: {}", error);
    for cause in error.chain().skip(1) {
        message.push_str(&format!("\n  caused by: {}", cause));
    }
    if let Some(hint) = hint {
        message.push_str("\n\n");
        message.push_str(hint);
    }
    message
}
