pub mod chat_controller;

#[cfg(test)]
mod chat_controller_test;

pub use chat_controller::{CancelToken, ChatCommand, ChatController, ChatHandle, ChatState};
