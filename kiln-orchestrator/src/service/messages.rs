//! User-facing notification texts
//!
//! Texts describe the outcome in plain words. Provider payloads and internal
//! error details stay in the logs.

use crate::service::payment::ValidationError;

pub fn training_succeeded(model_name: &str, result_url: Option<&str>) -> String {
    match result_url {
        Some(url) => format!("Your model \"{model_name}\" is ready: {url}"),
        None => format!("Your model \"{model_name}\" is ready."),
    }
}

pub fn training_failed(model_name: &str, refunded: Option<i64>) -> String {
    let mut text = format!("Training of \"{model_name}\" failed.");
    push_refund(&mut text, refunded);
    text
}

pub fn training_timed_out(model_name: &str, refunded: Option<i64>) -> String {
    let mut text = format!("Training of \"{model_name}\" did not finish in time.");
    push_refund(&mut text, refunded);
    text
}

pub fn training_canceled(model_name: &str, refunded: Option<i64>) -> String {
    let mut text = format!("Training of \"{model_name}\" was canceled.");
    push_refund(&mut text, refunded);
    text
}

pub fn validation_rejected(err: &ValidationError) -> String {
    match err {
        ValidationError::UserNotFound(_) => {
            "We could not find your account. Please start the bot again.".to_string()
        }
        ValidationError::MissingDestination => {
            "Set your provider account name before training a model.".to_string()
        }
        ValidationError::MissingCredential => {
            "Add your provider API token before training a model.".to_string()
        }
        ValidationError::InsufficientFunds { have, need } => {
            format!("Training costs {need} credits but your balance is {have}.")
        }
    }
}

pub fn payment_failed() -> String {
    "We could not reserve the training cost. Please try again.".to_string()
}

fn push_refund(text: &mut String, refunded: Option<i64>) {
    match refunded {
        Some(amount) if amount > 0 => {
            text.push_str(&format!(" {amount} credits were returned to your balance."))
        }
        _ => {}
    }
}
