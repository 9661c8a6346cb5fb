//! ELAN (`.eaf`) annotation documents
//!
//! An EAF file holds a shared time-slot table and a set of tiers. Tiers
//! without a parent own *alignable* annotations (two time-slot references);
//! tiers with a parent hold *referential* annotations that inherit the time
//! range of an annotation in the parent tier.
//!
//! [`EafDocument`] parses that structure into the typed model below and can
//! write itself back after mutation; everything it did not touch is emitted
//! byte for byte.
//!
//! # Example
//!
//! ```rust,no_run
//! use lgp_corpus::eaf::{EafDocument, TierAliases};
//!
//! # fn example(xml: &str) -> lgp_corpus::Result<()> {
//! let mut doc = EafDocument::parse_with_aliases(xml, &TierAliases::lgp_defaults())?;
//! let added = doc.add_annotation("GLOSA_P1_EXPRESSAO", "sorriso", 1_000, 1_500, None)?;
//! println!("new annotation {}", added.annotation_id);
//! let xml = doc.to_xml_string()?;
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod tree;

use std::collections::{BTreeMap, HashMap};

pub use document::{
    AddedAnnotation, AnnotationKind, EafAnnotation, EafDocument, EafTier, RemovedAnnotation,
    TimeSlot,
};
pub use tree::{Element, XmlTree};

/// Canonical transcription tier of the LGP corpus.
pub const TRANSCRIPTION_TIER: &str = "LP_P1 transcrição livre";

/// Canonical facial-expression gloss tier of the LGP corpus.
pub const EXPRESSION_TIER: &str = "GLOSA_P1_EXPRESSAO";

/// Maps alternate spellings of a tier id onto its canonical id.
///
/// Authoring tools have saved the same tier under differently encoded names
/// (UTF-8 read back as Latin-1, decomposed accents). Lookups and joins only
/// ever see the canonical form.
#[derive(Debug, Clone, Default)]
pub struct TierAliases {
    map: HashMap<String, String>,
}

impl TierAliases {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The encoding variants observed for the LGP transcription tier.
    #[must_use]
    pub fn lgp_defaults() -> Self {
        Self::new()
            // UTF-8 bytes decoded as Latin-1
            .with_alias("LP_P1 transcriÃ§Ã£o livre", TRANSCRIPTION_TIER)
            // NFD: c + combining cedilla, a + combining tilde
            .with_alias("LP_P1 transcric\u{327}a\u{303}o livre", TRANSCRIPTION_TIER)
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.map.insert(alias.into(), canonical.into());
        self
    }

    /// Canonical name for `name`, or `name` itself when it has no alias.
    #[must_use]
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.map.get(name).map_or(name, String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl From<BTreeMap<String, String>> for TierAliases {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self {
            map: map.into_iter().collect(),
        }
    }
}
