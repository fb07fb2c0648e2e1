//! Rendering of relay outcomes into tool content blocks.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::RelayError;

/// Separator the editor extension inserts between typed text and pasted images.
pub const IMAGE_MARKER: &str = "[图片已附加]";

static IMAGE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/([^;]+);base64,([^\s]+)").expect("valid regex")
});

const CONTINUE_REMINDER: &str = "IMPORTANT: carry out the user's instruction now. When you are done you MUST call the ask_continue tool again before ending your reply.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: String,
}

/// A reply split into its typed text and any pasted images.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserReply {
    pub text: Option<String>,
    pub images: Vec<ImageAttachment>,
    pub has_attachments: bool,
}

pub fn parse_user_input(input: &str) -> UserReply {
    let Some((prefix, rest)) = input.split_once(IMAGE_MARKER) else {
        let text = input.trim();
        return UserReply {
            text: (!text.is_empty()).then(|| input.to_string()),
            images: Vec::new(),
            has_attachments: false,
        };
    };

    let prefix = prefix.trim();
    let images = IMAGE_SEGMENT
        .captures_iter(rest)
        .map(|caps| ImageAttachment {
            mime_type: format!("image/{}", &caps[1]),
            data: caps[2].to_string(),
        })
        .collect();

    UserReply {
        text: (!prefix.is_empty()).then(|| prefix.to_string()),
        images,
        has_attachments: true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result payload of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolReply {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolReply {
    pub fn ok(content: Vec<ToolContent>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }
}

pub fn render_outcome(outcome: Result<String, RelayError>) -> ToolReply {
    match outcome {
        Ok(input) => render_reply(&input),
        Err(RelayError::Cancelled) => ToolReply::ok(vec![ToolContent::text(
            "The user cancelled the request. End the conversation here.",
        )]),
        Err(error @ RelayError::Expired { .. }) => ToolReply::ok(vec![ToolContent::text(format!(
            "No answer arrived from the user: {error}. The conversation timed out after inactivity."
        ))]),
        Err(error) => ToolReply::error(format!(
            "Error communicating with the editor extension: {error}\n\nMake sure the Ask Continue extension is installed and running in the editor."
        )),
    }
}

fn render_reply(input: &str) -> ToolReply {
    if input.trim().is_empty() {
        return ToolReply::ok(vec![ToolContent::text(
            "The user chose to end the conversation. This conversation is over.",
        )]);
    }

    let reply = parse_user_input(input);
    if !reply.has_attachments {
        return ToolReply::ok(vec![ToolContent::text(format!(
            "The user wants to continue with the following instruction:\n\n{input}\n\n{CONTINUE_REMINDER}"
        ))]);
    }

    let mut content = Vec::with_capacity(reply.images.len() + 2);
    content.push(ToolContent::text(match &reply.text {
        Some(text) => {
            format!("The user wants to continue with the following instruction:\n\n{text}")
        }
        None => "The user wants to continue and attached images:".to_string(),
    }));
    content.extend(reply.images.into_iter().map(|image| ToolContent::Image {
        data: image.data,
        mime_type: image.mime_type,
    }));
    content.push(ToolContent::text(format!("\n\n{CONTINUE_REMINDER}")));
    ToolReply::ok(content)
}
