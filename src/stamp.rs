use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use serde::Deserialize;

use crate::error::{ContractError, Result};

/// Target region in page coordinate space, origin bottom-left.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<(f64, f64, f64, f64)> for BoundingBox {
    fn from((x, y, width, height): (f64, f64, f64, f64)) -> Self {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }
}

/// Behavior for an out-of-range page number. The source system clamps to the
/// last page; strict mode rejects instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMode {
    #[default]
    Clamp,
    Strict,
}

/// Composites a raster signature image onto one page of the document,
/// aspect-preserving and centered within `bbox`, transparency respected.
/// Operates on a fresh copy loaded from `source`; the returned bytes are a new
/// revision and the input is never mutated. Everything happens in memory, so
/// no scratch files can be left behind on error paths.
pub fn stamp_image(
    source: &[u8],
    image_bytes: &[u8],
    page_number: u32,
    bbox: BoundingBox,
    mode: PageMode,
) -> Result<Vec<u8>> {
    let rgba = image::load_from_memory(image_bytes)
        .map_err(|e| ContractError::RenderingFailed(format!("signature image decode: {e}")))?
        .to_rgba8();
    stamp_rgba(source, &rgba, page_number, bbox, mode)
}

/// Shared compositing path for image stamps and rasterized text annotations.
pub(crate) fn stamp_rgba(
    source: &[u8],
    rgba: &image::RgbaImage,
    page_number: u32,
    bbox: BoundingBox,
    mode: PageMode,
) -> Result<Vec<u8>> {
    let (img_w, img_h) = rgba.dimensions();
    if img_w == 0 || img_h == 0 {
        return Err(ContractError::RenderingFailed(
            "signature image has zero dimensions".to_string(),
        ));
    }

    let mut doc = Document::load_mem(source)
        .map_err(|e| ContractError::RenderingFailed(format!("source document load: {e}")))?;
    let page_id = resolve_page(&doc, page_number, mode)?;

    let xobject_id = add_image_xobject(&mut doc, rgba)?;
    let xobject_name = format!("Sig{}", doc.max_id);
    attach_xobject(&mut doc, page_id, &xobject_name, xobject_id)?;

    // Aspect-preserving fit, centered within the box.
    let scale = (bbox.width / img_w as f64).min(bbox.height / img_h as f64);
    let draw_w = img_w as f64 * scale;
    let draw_h = img_h as f64 * scale;
    let draw_x = bbox.x + (bbox.width - draw_w) / 2.0;
    let draw_y = bbox.y + (bbox.height - draw_h) / 2.0;

    let draw_ops = format!(
        "q\n{draw_w:.2} 0 0 {draw_h:.2} {draw_x:.2} {draw_y:.2} cm\n/{xobject_name} Do\nQ\n"
    );
    append_content(&mut doc, page_id, draw_ops.into_bytes())?;

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ContractError::RenderingFailed(format!("save: {e}")))?;
    Ok(out)
}

fn resolve_page(doc: &Document, page_number: u32, mode: PageMode) -> Result<ObjectId> {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err(ContractError::RenderingFailed(
            "document has no pages".to_string(),
        ));
    }
    if let Some(&id) = pages.get(&page_number) {
        return Ok(id);
    }
    match mode {
        PageMode::Clamp => {
            let last = *pages.keys().max().expect("non-empty page tree");
            Ok(pages[&last])
        }
        PageMode::Strict => Err(ContractError::RenderingFailed(format!(
            "page {page_number} out of range (document has {} pages)",
            pages.len()
        ))),
    }
}

/// RGB image XObject with a DeviceGray SMask carrying the alpha channel, both
/// flate-compressed.
fn add_image_xobject(doc: &mut Document, rgba: &image::RgbaImage) -> Result<ObjectId> {
    let (width, height) = rgba.dimensions();
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }

    let compressed_alpha = deflate(&alpha)?;
    let mut smask_dict = Dictionary::new();
    smask_dict.set(b"Type", Object::Name(b"XObject".to_vec()));
    smask_dict.set(b"Subtype", Object::Name(b"Image".to_vec()));
    smask_dict.set(b"Width", Object::Integer(width as i64));
    smask_dict.set(b"Height", Object::Integer(height as i64));
    smask_dict.set(b"ColorSpace", Object::Name(b"DeviceGray".to_vec()));
    smask_dict.set(b"BitsPerComponent", Object::Integer(8));
    smask_dict.set(b"Filter", Object::Name(b"FlateDecode".to_vec()));
    let smask_id = doc.add_object(Object::Stream(Stream::new(smask_dict, compressed_alpha)));

    let compressed_rgb = deflate(&rgb)?;
    let mut image_dict = Dictionary::new();
    image_dict.set(b"Type", Object::Name(b"XObject".to_vec()));
    image_dict.set(b"Subtype", Object::Name(b"Image".to_vec()));
    image_dict.set(b"Width", Object::Integer(width as i64));
    image_dict.set(b"Height", Object::Integer(height as i64));
    image_dict.set(b"ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
    image_dict.set(b"BitsPerComponent", Object::Integer(8));
    image_dict.set(b"Filter", Object::Name(b"FlateDecode".to_vec()));
    image_dict.set(b"SMask", Object::Reference(smask_id));
    Ok(doc.add_object(Object::Stream(Stream::new(image_dict, compressed_rgb))))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ContractError::RenderingFailed(format!("compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ContractError::RenderingFailed(format!("compress: {e}")))
}

fn attach_xobject(
    doc: &mut Document,
    page_id: ObjectId,
    name: &str,
    xobject_id: ObjectId,
) -> Result<()> {
    let page_dict = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::RenderingFailed(format!("page object: {e}")))?;

    if page_dict
        .get(b"Resources")
        .map_or(true, |obj| obj.as_dict().is_err())
    {
        page_dict.set(b"Resources", Object::Dictionary(Dictionary::new()));
    }
    let resources = page_dict
        .get_mut(b"Resources")
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::RenderingFailed(format!("page resources: {e}")))?;

    if resources
        .get(b"XObject")
        .map_or(true, |obj| obj.as_dict().is_err())
    {
        resources.set(b"XObject", Object::Dictionary(Dictionary::new()));
    }
    let xobjects = resources
        .get_mut(b"XObject")
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::RenderingFailed(format!("xobject resources: {e}")))?;
    xobjects.set(name.as_bytes().to_vec(), Object::Reference(xobject_id));
    Ok(())
}

/// Appends a new content stream to the target page, converting a single
/// `/Contents` reference into an array rather than touching the existing
/// stream.
fn append_content(doc: &mut Document, page_id: ObjectId, ops: Vec<u8>) -> Result<()> {
    let stream_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), ops)));
    let page_dict = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::RenderingFailed(format!("page object: {e}")))?;

    let new_ref = Object::Reference(stream_id);
    let updated = match page_dict.get(b"Contents") {
        Ok(Object::Array(arr)) => {
            let mut arr = arr.clone();
            arr.push(new_ref);
            Object::Array(arr)
        }
        Ok(Object::Reference(existing)) => Object::Array(vec![Object::Reference(*existing), new_ref]),
        _ => Object::Array(vec![new_ref]),
    };
    page_dict.set(b"Contents", updated);
    Ok(())
}
