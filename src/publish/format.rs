// src/publish/format.rs
//! Telegram HTML rendering of an article.

use crate::model::{Article, TranslatedArticle};

/// Telegram rejects longer `sendMessage` texts.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Escaped title length, so a runaway title cannot crowd out the body.
const MAX_TITLE_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub image_url: Option<String>,
}

fn escape_len(c: char) -> usize {
    match c {
        '&' => 5,
        '<' | '>' => 4,
        _ => 1,
    }
}

/// Escape `s`, cutting it so the escaped result plus an ellipsis fits in `budget` chars.
fn escape_truncated(s: &str, budget: usize) -> String {
    let full: usize = s.chars().map(escape_len).sum();
    if full <= budget {
        return html_escape::encode_text(s).into_owned();
    }
    let mut used = 0;
    let mut cut = String::new();
    for c in s.chars() {
        let n = escape_len(c);
        if used + n + 1 > budget {
            break;
        }
        used += n;
        cut.push(c);
    }
    let mut out = html_escape::encode_text(cut.trim_end()).into_owned();
    out.push('…');
    out
}

/// `<b>title</b>`, body, hashtags, then the source link. Translated text wins
/// over the original when present.
pub fn render(article: &Article, translated: Option<&TranslatedArticle>, hashtags: &[String]) -> OutboundMessage {
    let (title, body) = match translated {
        Some(t) => (t.title.as_str(), t.body.as_str()),
        None => (article.title.as_str(), article.body.as_str()),
    };

    let mut tail = String::new();
    if !hashtags.is_empty() {
        tail.push_str("\n\n");
        tail.push_str(&hashtags.join(" "));
    }
    let source = html_escape::encode_text(&article.source_name);
    match &article.link {
        Some(link) => tail.push_str(&format!(
            "\n\n🔗 <a href=\"{}\">{}</a>",
            html_escape::encode_double_quoted_attribute(link),
            source
        )),
        None => tail.push_str(&format!("\n\n🔗 <i>{}</i>", source)),
    }
    let tail_len = tail.chars().count();

    // `<b></b>` is 7 chars.
    let title_budget = MAX_MESSAGE_CHARS
        .saturating_sub(tail_len + 7)
        .min(MAX_TITLE_CHARS);
    let head = format!("<b>{}</b>", escape_truncated(title, title_budget));

    // Room for the body after the blank line, and at least one char plus the ellipsis.
    let budget = MAX_MESSAGE_CHARS.saturating_sub(head.chars().count() + tail_len + 2);
    let text = if body.trim().is_empty() || budget < 2 {
        format!("{head}{tail}")
    } else {
        format!("{head}\n\n{}{tail}", escape_truncated(body, budget))
    };

    OutboundMessage {
        text,
        image_url: article.image_urls.first().cloned(),
    }
}
