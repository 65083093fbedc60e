//! Classification prompts.
//!
//! Both builders are pure: the same messages always yield byte-identical
//! prompts, which keeps runs reproducible against scripted providers.

use serde::Serialize;
use std::fmt::Write as _;

use crate::models::{sender_domain, Category, Message, SenderCategory, SuggestedRule};

/// Body excerpt length for single-message prompts
pub const MAX_BODY_CHARS: usize = 500;
/// Per-message subject length inside a batch prompt
pub const MAX_BATCH_SUBJECT_CHARS: usize = 100;
/// Per-message body length inside a batch prompt
pub const MAX_BATCH_BODY_CHARS: usize = 200;

/// Subjects shown to the model in a sender analysis prompt
pub const MAX_SENDER_SAMPLES: usize = 5;

/// Categories offered to the model, with the guidance shown for each
pub const TAXONOMY: [(Category, &str); 4] = [
    (
        Category::Junk,
        "spam, phishing, scams, unsolicited bulk mail, obvious fraud",
    ),
    (
        Category::Promotional,
        "marketing, newsletters, sales, deals, offers from companies the user knows",
    ),
    (
        Category::Important,
        "personal or work correspondence, bills, receipts, security alerts, account notices",
    ),
    (
        Category::Unknown,
        "anything that does not clearly fit the categories above",
    ),
];

/// A prompt covering several messages. `ids` lists the messages in the order
/// they appear in `text`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPrompt {
    pub ids: Vec<String>,
    pub text: String,
}

/// Truncate to at most `max` characters without splitting a code point
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn subject_or_placeholder(message: &Message) -> &str {
    if message.subject.trim().is_empty() {
        "(no subject)"
    } else {
        &message.subject
    }
}

fn sender_line(message: &Message) -> String {
    if message.sender_name.is_empty() || message.sender_name == message.sender {
        message.sender.clone()
    } else {
        format!("{} <{}>", message.sender_name, message.sender)
    }
}

fn write_taxonomy(out: &mut String) {
    out.push_str("Categories:\n");
    for (category, guidance) in TAXONOMY {
        let _ = writeln!(out, "- {}: {}", category.label(), guidance);
    }
}

pub fn build_prompt(message: &Message) -> String {
    let mut prompt = String::with_capacity(1024 + MAX_BODY_CHARS);

    prompt.push_str(
        "You are an email triage assistant. Classify the email below into exactly one category.\n\n",
    );
    write_taxonomy(&mut prompt);

    let _ = write!(
        prompt,
        "\nEmail:\nFrom: {}\nSubject: {}\nReceived: {}\nBody preview: {}\n",
        sender_line(message),
        subject_or_placeholder(message),
        message.received_at.to_rfc3339(),
        truncate_chars(message.snippet.trim(), MAX_BODY_CHARS),
    );

    prompt.push_str(
        "\nRespond with a single JSON object and nothing else:\n\
         {\"category\": \"JUNK|PROMOTIONAL|IMPORTANT|UNKNOWN\", \"confidence\": <number between 0 and 1>, \"reason\": \"<one short sentence>\"}\n",
    );

    prompt
}

#[derive(Serialize)]
struct BatchEntry<'a> {
    id: &'a str,
    sender: &'a str,
    subject: &'a str,
    body_preview: &'a str,
    received: String,
}

pub fn build_batch_prompt(messages: &[Message]) -> BatchPrompt {
    let entries: Vec<BatchEntry<'_>> = messages
        .iter()
        .map(|m| BatchEntry {
            id: &m.id,
            sender: &m.sender,
            subject: truncate_chars(subject_or_placeholder(m), MAX_BATCH_SUBJECT_CHARS),
            body_preview: truncate_chars(m.snippet.trim(), MAX_BATCH_BODY_CHARS),
            received: m.received_at.to_rfc3339(),
        })
        .collect();

    // Serializing borrowed strings and a String cannot fail
    let emails = serde_json::to_string_pretty(&entries).unwrap_or_default();

    let mut text = String::with_capacity(emails.len() + 1024);
    let _ = write!(
        text,
        "You are an email triage assistant. Classify each of the {} emails below into exactly one category.\n\n",
        messages.len()
    );
    write_taxonomy(&mut text);
    let _ = write!(text, "\nEmails:\n{}\n", emails);
    text.push_str(
        "\nRespond with a JSON array and nothing else, one object per email, using the email's id:\n\
         [{\"email_id\": \"<id>\", \"category\": \"JUNK|PROMOTIONAL|IMPORTANT|UNKNOWN\", \"confidence\": <number between 0 and 1>, \"reason\": \"<one short sentence>\"}]\n",
    );

    BatchPrompt {
        ids: messages.iter().map(|m| m.id.clone()).collect(),
        text,
    }
}

/// Prompt asking the model to judge a sender from sample subjects
pub fn build_sender_prompt(sender: &str, messages: &[Message]) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str("You are an email triage assistant. Analyze this sender to help classify its mail.\n\n");
    let _ = writeln!(prompt, "Sender: {}", sender);
    let _ = writeln!(prompt, "Domain: {}", sender_domain(sender));
    let _ = writeln!(prompt, "Messages seen: {}", messages.len());
    prompt.push_str("Sample subjects:\n");
    for message in messages.iter().take(MAX_SENDER_SAMPLES) {
        let _ = writeln!(
            prompt,
            "- {}",
            truncate_chars(subject_or_placeholder(message), MAX_BATCH_SUBJECT_CHARS)
        );
    }

    prompt.push_str(
        "\nDecide whether the sender is:\n\
         - TRUSTWORTHY: a legitimate business, service or person\n\
         - PROMOTIONAL: marketing, but legitimate\n\
         - SUSPICIOUS: likely spam or phishing\n\
         - UNKNOWN: not enough information\n",
    );

    let categories: Vec<&str> = SenderCategory::ALL.iter().map(|c| c.label()).collect();
    let rules: Vec<&str> = SuggestedRule::ALL.iter().map(|r| r.as_str()).collect();
    let _ = write!(
        prompt,
        "\nRespond with a single JSON object and nothing else:\n\
         {{\"sender_category\": \"{}\", \"confidence\": <number between 0 and 1>, \"reasoning\": \"<one short sentence>\", \"suggested_rule\": \"{}\"}}\n",
        categories.join("|"),
        rules.join("|"),
    );

    prompt
}
