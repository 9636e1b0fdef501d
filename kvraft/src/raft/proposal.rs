use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use super::Submission;

pub struct Proposal {
    pub data: Vec<u8>,
    // Answered as soon as the node has tried to append, never on commit.
    pub respond: Sender<Submission>,
}

impl Proposal {
    pub fn normal(data: Vec<u8>) -> (Self, Receiver<Submission>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal { data, respond: tx };
        (proposal, rx)
    }

    pub fn reply(self, submission: Submission) {
        // the submitter may have given up already
        let _ = self.respond.send(submission);
    }
}
