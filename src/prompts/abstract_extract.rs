//! Abstract completion prompts.
//!
//! The model sees the partial abstract from the search result and the visible
//! text of the publication page, and must return the full abstract verbatim.

/// System prompt for abstract extraction
pub const SYSTEM_PROMPT: &str = r#"You extract abstracts of academic publications from web page text.

Rules you MUST follow:
- Copy the abstract from the page text. Do NOT summarize, paraphrase or invent content.
- The partial abstract tells you which passage to look for; the complete abstract starts with or contains it.
- Output the abstract in English, as plain text only (no headings, no labels, no markdown).
- If the page text does not contain the abstract, answer exactly: I'm unable to find the abstract."#;

/// User prompt template for one page
/// Placeholders: {partial_abstract}, {page_text}
pub const USER_PROMPT_TEMPLATE: &str = r#"The following is an incomplete abstract:
{partial_abstract}

The following is the web content of this article/publication:
{page_text}

Find the complete abstract in the web content above and output it directly in English."#;

/// Build user prompt with the partial abstract and page text
pub fn build_user_prompt(partial_abstract: &str, page_text: &str) -> String {
    USER_PROMPT_TEMPLATE
        .replace("{partial_abstract}", partial_abstract)
        .replace("{page_text}", page_text)
}
