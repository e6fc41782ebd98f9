//! Conversation history with a bounded number of screenshots

use flowscout_common::{AgentMessage, ContentBlock};

/// Text left where a pruned screenshot used to be
pub const SCREENSHOT_PLACEHOLDER: &str = "[screenshot removed]";

/// The running conversation for one scenario.
///
/// After every [`prune`](Transcript::prune) at most `keep_images` image
/// blocks remain, and they are always the newest ones. Images nested in
/// tool results count the same as top-level images.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<AgentMessage>,
    keep_images: usize,
}

impl Transcript {
    pub fn new(keep_images: usize) -> Self {
        Self {
            messages: Vec::new(),
            keep_images,
        }
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.messages.iter().map(|m| count_images(&m.content)).sum()
    }

    /// Replace all but the newest `keep_images` images with a placeholder.
    ///
    /// Returns how many images were removed.
    pub fn prune(&mut self) -> usize {
        let mut kept = 0;
        let mut removed = 0;
        for message in self.messages.iter_mut().rev() {
            sweep(&mut message.content, self.keep_images, &mut kept, &mut removed);
        }
        removed
    }
}

fn count_images(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Image { .. } => 1,
            ContentBlock::ToolResult { content, .. } => count_images(content),
            _ => 0,
        })
        .sum()
}

// Newest first: blocks are visited back to front.
fn sweep(blocks: &mut [ContentBlock], keep: usize, kept: &mut usize, removed: &mut usize) {
    for block in blocks.iter_mut().rev() {
        match block {
            ContentBlock::Image { .. } => {
                if *kept < keep {
                    *kept += 1;
                } else {
                    *block = ContentBlock::text(SCREENSHOT_PLACEHOLDER);
                    *removed += 1;
                }
            }
            ContentBlock::ToolResult { content, .. } => sweep(content, keep, kept, removed),
            _ => {}
        }
    }
}
