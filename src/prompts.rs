//! Prompts for page OCR + translation and for chunk formatting.
//!
//! Every prompt lives here so that wording changes touch exactly one place
//! and unit tests can inspect them without a provider.

/// Language translations are produced in unless configured otherwise.
pub const DEFAULT_TARGET_LANGUAGE: &str = "Simplified Chinese";

/// System prompt for reading and translating one page image.
///
/// The model must answer with a strict JSON object so the reply can be
/// decoded into [`crate::providers::OcrResult`].
pub fn ocr_system_prompt(target_language: &str) -> String {
    format!(
        "You are a professional OCR and translation assistant. Read the image the user \
provides, first recognise all text that is present, then translate it into {target_language}. \
You must output a strict JSON object of the form \
{{\"hasText\":bool,\"sourceText\":\"original text\",\"translatedText\":\"translated text\"}}. \
If the image contains no text, set hasText to false and leave the other two fields as empty strings."
    )
}

/// User prompt sent alongside the page image.
pub fn ocr_user_prompt(target_language: &str, optimize_layout: bool) -> String {
    let mut prompt = format!(
        "Recognise all visible text in this page image and translate it into {target_language}. \
Keep the original paragraph order and return the JSON string."
    );
    if optimize_layout {
        prompt.push_str(
            " In sourceText and translatedText, preserve the structure and layout of the \
original: keep headings, lists and blank lines so the translation is tidy and easy to read.",
        );
    }
    prompt
}

/// System prompt for the layout formatter.
pub const FORMATTER_SYSTEM_PROMPT: &str = "You are a professional text editor who lays out long \
documents so they are clean and easy to read. Keep the meaning of the original, improve the \
structure of paragraphs, headings and lists, never omit or delete any content, and never add \
information that is not in the original.";

const FORMATTER_GUIDELINE: &str = "Follow these layout rules:
1. Keep chapter titles and their hierarchy, but do not repeat numbering or add extra bold.
2. Remove running headers, footers, page numbers (such as \"Page 323\") and repeated book titles or author lines.
3. Keep body paragraphs in order and in full; do not cut or summarise.
4. Separate paragraphs with blank lines; use clear bullets or numbers for lists.
5. For tables or unusual layouts, describe their structure in concise prose.";

/// User prompt for one formatter chunk.
pub fn formatter_user_prompt(file_name: &str, text: &str) -> String {
    format!(
        "{FORMATTER_GUIDELINE}\n\nAttachment: {file_name}\nOutput the cleaned-up body text.\n\nText:\n{text}"
    )
}
