//! Text classification and cost model.
//!
//! Both are pure functions of the probed document so they can be tested
//! without a PDF engine. The coefficients are fixed; they have no derivation
//! beyond "what the ingestion team bills", so keep them exactly as they are.

use serde::{Deserialize, Serialize};

/// Pages inspected when deciding whether a document is text-based.
pub const TEXT_SAMPLE_PAGES: usize = 3;

/// Average characters per sampled page a document must exceed to be text-based.
pub const TEXT_CHARS_THRESHOLD: usize = 100;

/// Page count at which a document is processed with the parallel strategy.
pub const PARALLEL_PAGE_THRESHOLD: usize = 10;

/// Flat cost per document.
pub const BASE_COST: f64 = 0.10;

/// Cost per page.
pub const COST_PER_PAGE: f64 = 0.05;

/// Cost per MiB of stored file.
pub const COST_PER_MIB: f64 = 0.02;

/// Surcharge multiplier for image-heavy documents.
pub const IMAGE_MULTIPLIER: f64 = 1.5;

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Outcome of sampling one page for text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSample {
    /// Text was extracted; `chars` is its length in bytes of UTF-8.
    Text { chars: usize },
    /// The page's content could not be extracted. Not counted.
    Unreadable,
}

/// Result of the text-vs-image classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextClassification {
    /// Pages whose text was successfully extracted.
    pub pages_sampled: usize,
    /// Total characters across successfully sampled pages.
    pub total_chars: usize,
    /// `total_chars / pages_sampled`, floor division; 0 when nothing was sampled.
    pub avg_chars_per_page: usize,
    /// `avg_chars_per_page > TEXT_CHARS_THRESHOLD`, false when nothing was sampled.
    pub is_text_based: bool,
}

/// Classify a document from its sampled pages.
///
/// Unreadable pages are skipped. With zero readable samples the document is
/// treated as image-heavy.
pub fn classify_text(samples: &[PageSample]) -> TextClassification {
    let (pages_sampled, total_chars) =
        samples
            .iter()
            .fold((0usize, 0usize), |(pages, chars), sample| match sample {
                PageSample::Text { chars: c } => (pages + 1, chars + c),
                PageSample::Unreadable => (pages, chars),
            });

    if pages_sampled == 0 {
        return TextClassification {
            pages_sampled,
            total_chars,
            avg_chars_per_page: 0,
            is_text_based: false,
        };
    }

    let avg_chars_per_page = total_chars / pages_sampled;
    TextClassification {
        pages_sampled,
        total_chars,
        avg_chars_per_page,
        is_text_based: avg_chars_per_page > TEXT_CHARS_THRESHOLD,
    }
}

/// Number of leading pages to sample for a document with `page_count` pages.
pub fn sample_size(page_count: usize) -> usize {
    page_count.min(TEXT_SAMPLE_PAGES)
}

/// Estimated processing cost in dollars.
///
/// `(BASE_COST + pages * COST_PER_PAGE + MiB * COST_PER_MIB) * multiplier`
/// where the multiplier is [`IMAGE_MULTIPLIER`] for documents that are not
/// text-based.
pub fn estimate_cost(page_count: usize, file_size_bytes: u64, is_text_based: bool) -> f64 {
    let page_cost = page_count as f64 * COST_PER_PAGE;
    let size_cost = file_size_bytes as f64 / BYTES_PER_MIB * COST_PER_MIB;
    let multiplier = if is_text_based { 1.0 } else { IMAGE_MULTIPLIER };
    (BASE_COST + page_cost + size_cost) * multiplier
}

/// Processing strategy chosen from the page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Simple,
    Parallel,
}

impl ProcessType {
    pub fn from_page_count(page_count: usize) -> Self {
        if page_count >= PARALLEL_PAGE_THRESHOLD {
            ProcessType::Parallel
        } else {
            ProcessType::Simple
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Simple => "simple",
            ProcessType::Parallel => "parallel",
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(chars: usize) -> PageSample {
        PageSample::Text { chars }
    }

    #[test]
    fn process_type_boundary() {
        assert_eq!(ProcessType::from_page_count(0), ProcessType::Simple);
        assert_eq!(ProcessType::from_page_count(9), ProcessType::Simple);
        assert_eq!(ProcessType::from_page_count(10), ProcessType::Parallel);
        assert_eq!(ProcessType::from_page_count(500), ProcessType::Parallel);
    }

    #[test]
    fn process_type_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessType::Parallel).unwrap(),
            "\"parallel\""
        );
        assert_eq!(ProcessType::Simple.to_string(), "simple");
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!classify_text(&[text(100)]).is_text_based);
        assert!(classify_text(&[text(101)]).is_text_based);
    }

    #[test]
    fn average_uses_floor_division() {
        // 302 / 3 = 100.67 → 100 → not text-based
        let c = classify_text(&[text(100), text(100), text(102)]);
        assert_eq!(c.avg_chars_per_page, 100);
        assert!(!c.is_text_based);
    }

    #[test]
    fn unreadable_pages_are_not_counted() {
        let c = classify_text(&[PageSample::Unreadable, text(250), PageSample::Unreadable]);
        assert_eq!(c.pages_sampled, 1);
        assert_eq!(c.avg_chars_per_page, 250);
        assert!(c.is_text_based);
    }

    #[test]
    fn nothing_sampled_is_not_text_based() {
        let c = classify_text(&[PageSample::Unreadable, PageSample::Unreadable]);
        assert_eq!(c.pages_sampled, 0);
        assert!(!c.is_text_based);
        assert!(!classify_text(&[]).is_text_based);
    }

    #[test]
    fn sample_size_caps_at_three() {
        assert_eq!(sample_size(0), 0);
        assert_eq!(sample_size(2), 2);
        assert_eq!(sample_size(3), 3);
        assert_eq!(sample_size(40), 3);
    }

    #[test]
    fn cost_formula() {
        let five_mib = 5 * 1_048_576;
        let expected = (0.10 + 3.0 * 0.05 + 5.0 * 0.02) * 1.5;
        assert!((estimate_cost(3, five_mib, false) - expected).abs() < 1e-12);
        assert!((estimate_cost(3, five_mib, true) - expected / 1.5).abs() < 1e-12);
        assert!((estimate_cost(0, 0, true) - 0.10).abs() < 1e-12);
    }

    #[test]
    fn cost_is_monotonic() {
        for text_based in [true, false] {
            let mut last = estimate_cost(0, 1_000, text_based);
            for pages in 1..50 {
                let c = estimate_cost(pages, 1_000, text_based);
                assert!(c > last);
                last = c;
            }
            let mut last = estimate_cost(5, 0, text_based);
            for size in (1..20).map(|k| k * 100_000) {
                let c = estimate_cost(5, size, text_based);
                assert!(c > last);
                last = c;
            }
        }
    }

    #[test]
    fn image_heavy_documents_cost_more() {
        assert!(estimate_cost(4, 2_000_000, false) > estimate_cost(4, 2_000_000, true));
    }
}
