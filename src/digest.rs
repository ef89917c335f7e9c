use chrono_tz::Tz;

use crate::models::Event;

pub const DIGEST_SUBJECT: &str = "Weekly Event Update";
pub const CONFIRMATION_SUBJECT: &str = "Subscription Confirmed - Event Updates";

pub fn render_confirmation(email: &str) -> String {
    format!(
        "<html><body>\n<h1>You're subscribed</h1>\n<p>{email} will receive a digest of upcoming events every Monday morning.</p>\n</body></html>\n",
        email = escape_html(email)
    )
}

pub fn render_digest(
    email: &str,
    events: &[Event],
    tz: Tz,
    unsubscribe_url: Option<&str>,
) -> String {
    let mut html = String::from("<html><body>\n<h1>Upcoming events</h1>\n<ul>\n");
    for event in events {
        html.push_str(&render_item(event, tz));
    }
    html.push_str("</ul>\n");
    html.push_str(&format!(
        "<p>Sent to {}.</p>\n",
        escape_html(email)
    ));
    if let Some(url) = unsubscribe_url {
        html.push_str(&format!(
            "<p><a href=\"{}\">Unsubscribe</a></p>\n",
            escape_html(url)
        ));
    }
    html.push_str("</body></html>\n");
    html
}

fn render_item(event: &Event, tz: Tz) -> String {
    let when = event
        .start_time
        .map(|dt| dt.with_timezone(&tz).format("%A, %B %e at %H:%M").to_string())
        .or_else(|| event.start_text.clone())
        .unwrap_or_else(|| "Date TBA".to_string());

    let mut lines = vec![
        format!("<strong>{}</strong>", escape_html(&event.title())),
        escape_html(&event.venue_label()),
        escape_html(&when),
        format!("Price: {}", escape_html(&event.cover_charge)),
    ];

    if !event.tags.is_empty() {
        lines.push(format!("Genres: {}", escape_html(&event.tags.join(", "))));
    }
    if let Some(age) = &event.age_limit {
        lines.push(format!("Age limit: {}", escape_html(age)));
    }
    if event.sold_out {
        lines.push("<em>Sold out</em>".to_string());
    } else if let Some(ticket) = &event.ticket_url {
        lines.push(format!(
            "<a href=\"{url}\">Tickets</a>",
            url = escape_html(ticket)
        ));
    }

    format!("<li>{}</li>\n", lines.join("<br>"))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
