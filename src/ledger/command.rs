//! Commands
//!
//! A `Command` is the executable form of one scheduled operation. It carries
//! the node cache updates to apply once the executor reports success.

use crate::node::Node;
use crate::op::{OpKind, Operation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution outcome reported back by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "error")]
pub enum CommandStatus {
    Pending,
    Completed,
    Failed(String),
}

/// One operation ready for an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: Uuid,
    pub op: Operation,
    pub status: CommandStatus,
    /// Whether removals go to the provider's trash
    pub to_trash: bool,
    /// Nodes to upsert into the cache on success
    pub upserted: Vec<Node>,
    /// Nodes to remove from the cache on success
    pub removed: Vec<Node>,
}

impl Command {
    pub fn new(op: Operation, to_trash: bool) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            op,
            status: CommandStatus::Pending,
            to_trash,
            upserted: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = CommandStatus::Completed;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = CommandStatus::Failed(error.into());
    }

    /// Record a node the executor created or changed
    pub fn with_upserted(mut self, node: Node) -> Self {
        self.upserted.push(node);
        self
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, CommandStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            CommandStatus::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Turns scheduled operations into executable commands
pub trait CommandBuilder: Send + Sync {
    fn build(&self, op: Operation) -> Command;
}

/// Prefills the cache updates each operation kind implies. Executors may
/// replace them with what the provider actually returned.
#[derive(Debug, Clone)]
pub struct DefaultCommandBuilder {
    to_trash: bool,
}

impl DefaultCommandBuilder {
    pub fn new(to_trash: bool) -> Self {
        Self { to_trash }
    }
}

impl Default for DefaultCommandBuilder {
    fn default() -> Self {
        Self::new(true)
    }
}

fn live(node: &Node) -> Node {
    let mut node = node.clone();
    node.is_live = true;
    node
}

impl CommandBuilder for DefaultCommandBuilder {
    fn build(&self, op: Operation) -> Command {
        let mut command = Command::new(op, self.to_trash);
        let op = &command.op;

        let (upserted, removed) = match (op.kind, &op.dst_node) {
            (OpKind::Mkdir, _) => (vec![live(&op.src_node)], vec![]),
            (OpKind::Rm, _) => (vec![], vec![op.src_node.clone()]),
            (OpKind::Cp | OpKind::CpOnto | OpKind::Up, Some(dst)) => {
                let mut dst = live(dst);
                if op.src_node.content_hash.is_some() {
                    dst.content_hash = op.src_node.content_hash.clone();
                    dst.size = op.src_node.size;
                }
                (vec![dst], vec![])
            }
            (OpKind::Mv | OpKind::MvOnto, Some(dst)) => {
                let mut dst = live(dst);
                dst.content_hash = op.src_node.content_hash.clone();
                dst.size = op.src_node.size;
                (vec![dst], vec![op.src_node.clone()])
            }
            // transfer kinds always carry a destination
            (_, None) => (vec![], vec![]),
        };

        command.upserted = upserted;
        command.removed = removed;
        command
    }
}
