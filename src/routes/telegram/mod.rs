mod handler;
mod model;

pub use handler::{
    deeplink,
    manual_verify,
    verify_status,
    verify_wait,
    webhook,
    webhook_info
};
pub use model::{
    StartOutcome, TelegramIdentity, VerifyError, apply_verification, membership_satisfied,
    process_callback_query, process_start_command, wait_for_verification,
};
