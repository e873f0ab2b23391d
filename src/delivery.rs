//! Ways of getting HTML in front of the browser.
//!
//! Each [`Delivery`] variant turns a payload into a [`Target`] the backend can
//! navigate to. A target owns whatever keeps its URL reachable (for
//! local-serve, the content server) and releases it when dropped.

use crate::content_server::ContentServer;
use crate::{RenderOptions, Result};
use base64::Engine as Base64Engine;
use std::fmt;

const DATA_URL_PREFIX: &str = "data:text/html;charset=utf-8;base64,";

/// A content-delivery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Embed the HTML as a base64 `data:` URI and navigate to it directly
    InlineEmbed,
    /// Serve the HTML from an ephemeral server on a loopback port
    LocalServe,
}

impl Delivery {
    /// Strategies to attempt, in order.
    ///
    /// Inline embedding is tried first with local-serve as the fallback;
    /// `prefer_local_server` skips straight to local-serve with no fallback.
    pub fn plan(prefer_local_server: bool) -> Vec<Delivery> {
        if prefer_local_server {
            vec![Delivery::LocalServe]
        } else {
            vec![Delivery::InlineEmbed, Delivery::LocalServe]
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Delivery::InlineEmbed => "inline-embed",
            Delivery::LocalServe => "local-serve",
        }
    }

    /// Capture quality used with this strategy
    pub fn quality(&self, opts: &RenderOptions) -> u8 {
        match self {
            Delivery::InlineEmbed => opts.inline_quality,
            Delivery::LocalServe => opts.local_quality,
        }
    }

    /// Make `html` reachable and return where to navigate.
    pub fn prepare(&self, html: &str) -> Result<Target> {
        match self {
            Delivery::InlineEmbed => Ok(Target {
                url: data_url(html),
                server: None,
            }),
            Delivery::LocalServe => {
                let server = ContentServer::start(html.to_string())?;
                Ok(Target {
                    url: server.url(),
                    server: Some(server),
                })
            }
        }
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A navigable location for one render attempt
pub struct Target {
    url: String,
    server: Option<ContentServer>,
}

impl Target {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The backing content server, if this target has one
    pub fn server(&self) -> Option<&ContentServer> {
        self.server.as_ref()
    }
}

/// `data:` URI carrying `html` as base64
pub fn data_url(html: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(html.as_bytes());
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + encoded.len());
    url.push_str(DATA_URL_PREFIX);
    url.push_str(&encoded);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_falls_back_to_local_serve() {
        assert_eq!(
            Delivery::plan(false),
            vec![Delivery::InlineEmbed, Delivery::LocalServe]
        );
        assert_eq!(Delivery::plan(true), vec![Delivery::LocalServe]);
    }

    #[test]
    fn data_url_is_base64_html() {
        let url = data_url("<html><body>Hello</body></html>");
        assert_eq!(
            url,
            "data:text/html;charset=utf-8;base64,PGh0bWw+PGJvZHk+SGVsbG88L2JvZHk+PC9odG1sPg=="
        );
    }

    #[test]
    fn data_url_survives_non_ascii() {
        let url = data_url("<p>héllo 世界</p>");
        let payload = url.strip_prefix(DATA_URL_PREFIX).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(payload).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "<p>héllo 世界</p>");
    }

    #[test]
    fn qualities_follow_options() {
        let opts = RenderOptions::default();
        assert_eq!(Delivery::InlineEmbed.quality(&opts), 100);
        assert_eq!(Delivery::LocalServe.quality(&opts), 90);
    }

    #[test]
    fn inline_target_needs_no_server() {
        let target = Delivery::InlineEmbed.prepare("<p>x</p>").unwrap();
        assert!(target.url().starts_with(DATA_URL_PREFIX));
        assert!(target.server().is_none());
    }

    #[test]
    fn local_target_owns_a_server() {
        let target = Delivery::LocalServe.prepare("<p>x</p>").unwrap();
        assert!(target.url().starts_with("http://127.0.0.1:"));
        assert!(target.server().is_some());
    }
}
