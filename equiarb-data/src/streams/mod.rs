pub mod consumer;
pub mod handler;

use tokio::sync::mpsc;

use crate::{
    error::FeedError,
    shared::subscription_models::{StreamCommand, StreamMode},
};

/// Cloneable control handle for one running connection.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    command_tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    pub fn new(command_tx: mpsc::UnboundedSender<StreamCommand>) -> Self {
        Self { command_tx }
    }

    pub fn subscribe(&self, tokens: Vec<u32>, mode: StreamMode) -> Result<(), FeedError> {
        self.send(StreamCommand::Subscribe { tokens, mode })
    }

    pub fn unsubscribe(&self, tokens: Vec<u32>) -> Result<(), FeedError> {
        self.send(StreamCommand::Unsubscribe { tokens })
    }

    pub fn set_mode(&self, tokens: Vec<u32>, mode: StreamMode) -> Result<(), FeedError> {
        self.send(StreamCommand::SetMode { tokens, mode })
    }

    pub fn stop(&self) -> Result<(), FeedError> {
        self.send(StreamCommand::Stop)
    }

    fn send(&self, command: StreamCommand) -> Result<(), FeedError> {
        self.command_tx
            .send(command)
            .map_err(|error| FeedError::Subscribe(format!("connection closed: {:?}", error.0)))
    }
}
