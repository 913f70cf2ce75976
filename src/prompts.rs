//! Prompts for the vision-based label locator.
//!
//! Keeping the instruction text here, away from the request plumbing in
//! [`crate::pipeline::vision`], lets tests inspect the reply contract the
//! parser in [`crate::pipeline::locate`] relies on.

/// Instruction sent alongside the page image.
///
/// `{width}` and `{height}` are replaced with the pixel size of the image
/// actually sent; see [`locator_prompt`].
pub const LABEL_LOCATOR_PROMPT: &str = r#"This image is a page of {width}x{height} pixels that may contain a shipping label.

A shipping label is the rectangular area carrying the recipient address, the sender address, carrier branding (UPS, FedEx, USPS, DHL, ...) and one or more barcodes. Packing slips, return instructions, receipts and advertising around it are NOT part of the label.

Find the single shipping label and answer with one JSON object and nothing else:

{"found": true, "x1": <left>, "y1": <top>, "x2": <right>, "y2": <bottom>}

Coordinates are integer pixels in this image, origin at the top-left corner. x2 > x1 and y2 > y1.
If the whole page is the label, return the full page rectangle.
If there is no shipping label on the page, answer:

{"found": false}"#;

/// Build the locator instruction for an image of `width`×`height` pixels.
pub fn locator_prompt(width: u32, height: u32) -> String {
    LABEL_LOCATOR_PROMPT
        .replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
}
