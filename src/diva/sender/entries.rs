use serde::Deserialize;

/// App-only OAuth token returned by the platform's token endpoint.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct TokenEntry {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// A paginated listing envelope wrapping one feed page.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct ListingEntry {
    pub data: ListingData,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct ListingData {
    /// Cursor for the next page, absent on the last one.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub children: Vec<ThingEntry>,
}

/// One feed item: a submission (`t3`) or a comment (`t1`).
#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct ThingEntry {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub data: ThingData,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct ThingData {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub selftext: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    /// Title of the parent submission, present on comment listings.
    #[serde(default)]
    pub link_title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Nested replies inside a thread view. The API sends an empty string
    /// instead of a listing when there are none.
    #[serde(default)]
    pub replies: RepliesEntry,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum RepliesEntry {
    Listing(Box<ListingEntry>),
    Text(String),
}

impl Default for RepliesEntry {
    fn default() -> Self {
        RepliesEntry::Text(String::new())
    }
}

impl ThingData {
    /// All text of this item worth searching for links.
    pub(crate) fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(title) = self.title.as_deref() {
            parts.push(title);
        }
        if let Some(selftext) = self.selftext.as_deref() {
            parts.push(selftext);
        }
        if let Some(body) = self.body.as_deref() {
            parts.push(body);
        }
        if let Some(url) = self.url.as_deref() {
            parts.push(url);
        }
        parts.join("\n")
    }

    /// The item's own title, or its parent submission's for comments.
    pub(crate) fn display_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.link_title.as_deref())
    }

    /// Absolute permalink to the item.
    pub(crate) fn full_permalink(&self) -> Option<String> {
        self.permalink
            .as_deref()
            .map(|path| format!("https://www.reddit.com{path}"))
    }

    /// Body text trimmed down to a tag-friendly description.
    pub(crate) fn description(&self) -> Option<String> {
        let text = self.selftext.as_deref().or(self.body.as_deref())?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

impl ListingEntry {
    /// Appends the text of every item in this listing, following nested
    /// replies, into `out`. Used when searching a whole thread for links.
    pub(crate) fn flatten_text_into(&self, out: &mut String) {
        for thing in &self.data.children {
            let text = thing.data.searchable_text();
            if !text.is_empty() {
                out.push_str(&text);
                out.push('\n');
            }
            if let RepliesEntry::Listing(nested) = &thing.data.replies {
                nested.flatten_text_into(out);
            }
        }
    }
}
