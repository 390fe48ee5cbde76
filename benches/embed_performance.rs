// Run with: cargo bench --bench embed_performance

use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use lopdf::{dictionary, Document, Object, Stream};
use signflow_core::features::pdf::{
    embed_annotation, screen_to_pdf, server_signature_request, AnnotationContent, EmbedRequest,
    PageSize, PageTarget, Placement, ScreenPoint, Viewport,
};

fn letter_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            let content_id = doc.add_object(Stream::new(dictionary! {}, b"% blank\n".to_vec()));
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            })
            .into()
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).expect("save pdf");
    out
}

fn signature_png() -> Vec<u8> {
    let img = RgbaImage::from_fn(240, 80, |x, _| Rgba([0, 0, 0, if x % 3 == 0 { 0 } else { 255 }]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageOutputFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn benchmark_embedding(c: &mut Criterion) {
    let pdf = letter_pdf(10);
    let png = signature_png();

    c.bench_function("screen_to_pdf", |b| {
        let page = PageSize { width: 612.0, height: 792.0 };
        let viewport = Viewport::new(900.0, 1164.7);
        b.iter(|| {
            black_box(screen_to_pdf(page, viewport, ScreenPoint::new(312.0, 640.0), 60.0).unwrap())
        })
    });

    c.bench_function("embed_text_field", |b| {
        let request = EmbedRequest {
            placement: Placement {
                page: PageTarget::Index(4),
                anchor: Some(ScreenPoint::new(100.0, 200.0)),
                viewport: Viewport::new(612.0, 792.0),
                page_size: None,
                content_height_px: 20.0,
            },
            content: AnnotationContent::text("Sam Signer"),
            captions: Vec::new(),
        };
        b.iter(|| black_box(embed_annotation(&pdf, &request).unwrap()))
    });

    c.bench_function("embed_server_signature", |b| {
        let request = server_signature_request(png.clone(), "Signed: 10/19/2026 09:05".into());
        b.iter(|| black_box(embed_annotation(&pdf, &request).unwrap()))
    });
}

criterion_group!(benches, benchmark_embedding);
criterion_main!(benches);
