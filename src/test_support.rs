//! Fixtures shared by the unit tests.

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage, Rgba, RgbaImage};
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Cursor;

/// Minimal PDF with `pages` empty pages of the given size.
pub fn blank_pdf(pages: usize, width: f64, height: f64) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages);
    for n in 0..pages {
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            format!("% page {}\n", n + 1).into_bytes(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), Object::Integer(width.round() as i64), Object::Integer(height.round() as i64)],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

/// Single letter-size page whose only content stream is `content`.
pub fn pdf_with_page_content(content: &[u8]) -> Vec<u8> {
    let mut doc = Document::load_mem(&blank_pdf(1, 612.0, 792.0)).unwrap();
    let page_id = *doc.get_pages().get(&1).unwrap();
    let content_id = doc.get_page_contents(page_id)[0];
    if let Ok(Object::Stream(stream)) = doc.get_object_mut(content_id) {
        stream.set_content(content.to_vec());
    }
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

/// PNG with a transparent left column so the soft mask path is exercised.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, _| {
        if x == 0 {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([20, 20, 120, 255])
        }
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    out
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([10, 10, 10]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(90))
        .unwrap();
    out
}
