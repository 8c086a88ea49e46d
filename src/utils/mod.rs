//! Small helpers shared by the application modules.

/// Strip hyphens and surrounding whitespace from an ISBN; blank becomes `None`.
pub fn normalize_isbn(isbn: Option<&str>) -> Option<String> {
    let normalized: String = isbn?
        .trim()
        .chars()
        .filter(|ch| *ch != '-' && !ch.is_whitespace())
        .collect();
    (!normalized.is_empty()).then_some(normalized)
}

/// `(limit, offset)` for a 1-based page. Page zero is treated as the first page.
pub fn page_window(page: u32, page_size: u32) -> (i64, i64) {
    let page = page.max(1);
    let size = i64::from(page_size.max(1));
    (size, (i64::from(page) - 1) * size)
}

/// Parse a 1-based page number, falling back to the first page.
pub fn parse_page(raw: Option<&str>) -> u32 {
    raw.and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|page| *page >= 1)
        .unwrap_or(1)
}
