use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use similar::TextDiff;

use crate::errors::ValidationError;

/// Informational pages editable from the back office.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    About,
    Privacy,
    Shipping,
    Returns,
    Terms,
    Contact,
    Faq,
}

impl PageType {
    pub const ALL: [PageType; 7] = [
        PageType::About,
        PageType::Privacy,
        PageType::Shipping,
        PageType::Returns,
        PageType::Terms,
        PageType::Contact,
        PageType::Faq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::About => "about",
            Self::Privacy => "privacy",
            Self::Shipping => "shipping",
            Self::Returns => "returns",
            Self::Terms => "terms",
            Self::Contact => "contact",
            Self::Faq => "faq",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        PageType::ALL
            .into_iter()
            .find(|page| page.as_str() == normalized)
            .ok_or_else(|| format!("Unknown page type '{raw}'."))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSection {
    pub heading: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sections: Vec<ContentSection>,
}

impl PageContent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingField("page title"));
        }
        if let Some(index) = self
            .sections
            .iter()
            .position(|section| section.heading.trim().is_empty())
        {
            return Err(ValidationError::SectionMissingHeading { index });
        }
        Ok(())
    }

    /// Plain-text rendering used for diffs and CLI output.
    pub fn render_text(&self) -> String {
        let mut out = format!("# {}\n", self.title.trim());
        if !self.description.trim().is_empty() {
            out.push_str(&format!("\n{}\n", self.description.trim()));
        }
        for section in &self.sections {
            out.push_str(&format!("\n## {}\n", section.heading.trim()));
            for line in section.body.trim().lines() {
                out.push_str(line.trim_end());
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub page_type: PageType,
    pub version: u32,
    pub content: PageContent,
    #[serde(default)]
    pub author: Option<String>,
    pub created_at: String,
}

/// Unified diff between two page revisions, one line per entry.
pub fn content_diff(from: &ContentVersion, to: &ContentVersion) -> Vec<String> {
    let before = from.content.render_text();
    let after = to.content.render_text();
    let diff = TextDiff::from_lines(&before, &after);
    diff.unified_diff()
        .header(
            &format!("{} v{}", from.page_type, from.version),
            &format!("{} v{}", to.page_type, to.version),
        )
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(version: u32, body: &str) -> ContentVersion {
        ContentVersion {
            page_type: PageType::Shipping,
            version,
            content: PageContent {
                title: "Shipping".to_string(),
                description: "How we ship".to_string(),
                sections: vec![ContentSection {
                    heading: "Rates".to_string(),
                    body: body.to_string(),
                }],
            },
            author: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn page_type_parses_case_insensitively() {
        assert_eq!("FAQ".parse::<PageType>(), Ok(PageType::Faq));
        assert!("blog".parse::<PageType>().is_err());
        assert_eq!(PageType::Privacy.to_string(), "privacy");
    }

    #[test]
    fn validate_requires_title_and_headings() {
        let mut content = version(1, "Free over 50").content;
        assert_eq!(content.validate(), Ok(()));
        content.sections.push(ContentSection::default());
        assert_eq!(
            content.validate(),
            Err(ValidationError::SectionMissingHeading { index: 1 })
        );
        content.title.clear();
        assert_eq!(
            content.validate(),
            Err(ValidationError::MissingField("page title"))
        );
    }

    #[test]
    fn diff_shows_changed_section_body() {
        let lines = content_diff(&version(1, "Free over 50"), &version(2, "Free over 75"));
        assert!(lines.iter().any(|line| line == "--- shipping v1"));
        assert!(lines.iter().any(|line| line == "-Free over 50"));
        assert!(lines.iter().any(|line| line == "+Free over 75"));
    }

    #[test]
    fn identical_versions_have_empty_diff() {
        assert!(content_diff(&version(1, "same"), &version(2, "same")).is_empty());
    }
}
