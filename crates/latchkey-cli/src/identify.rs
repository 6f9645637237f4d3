//! `latchkey gallery` and `latchkey identify`.

use std::path::Path;

use anyhow::{Context, Result};
use latchkey_core::{
    geometry, BoundingBox, Detector, Encoder, EuclideanMatcher, Gallery, MatchResult, Matcher,
};
use serde::Serialize;

use crate::{models, ModelArgs};

#[derive(Serialize)]
struct IdentityRow<'a> {
    name: &'a str,
    norm: f32,
}

#[derive(Serialize)]
struct FaceReport {
    /// `[left, top, right, bottom]` of the squared, clipped region.
    region: [i32; 4],
    score: f32,
    #[serde(flatten)]
    result: MatchResult,
}

pub fn list_gallery(gallery_dir: &Path, args: &ModelArgs, json: bool) -> Result<()> {
    let (mut detector, mut encoder) = models::load(args)?;
    let gallery = enroll(gallery_dir, &mut detector, &mut encoder, args)?;

    let rows: Vec<IdentityRow> = gallery
        .entries()
        .iter()
        .map(|e| IdentityRow {
            name: &e.name,
            norm: e.encoding.norm(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{} identities in {}", rows.len(), gallery_dir.display());
    for row in &rows {
        println!("  {:<24} |e| = {:.3}", row.name, row.norm);
    }
    Ok(())
}

pub fn identify(
    image_path: &Path,
    gallery_dir: &Path,
    tolerance: f32,
    args: &ModelArgs,
    json: bool,
) -> Result<()> {
    anyhow::ensure!(tolerance >= 0.0, "tolerance must be non-negative");
    let (mut detector, mut encoder) = models::load(args)?;
    let gallery = enroll(gallery_dir, &mut detector, &mut encoder, args)?;

    let frame = image::open(image_path)
        .with_context(|| format!("cannot read {}", image_path.display()))?
        .to_rgb8();
    let faces = detector
        .detect(&frame, args.thresholds)
        .context("detection failed")?;

    let matcher = EuclideanMatcher;
    let mut reports = Vec::with_capacity(faces.len());
    for face in &faces {
        let bbox = BoundingBox::from(face);
        let Some(region) = geometry::clip(&geometry::square(&bbox), frame.width(), frame.height())
        else {
            continue;
        };
        let Some(crop) = geometry::normalize(&bbox, &frame) else {
            continue;
        };
        let encoding = encoder.encode(&crop).context("encoding failed")?;
        reports.push(FaceReport {
            region: [region.left, region.top, region.right, region.bottom],
            score: face.score,
            result: matcher.compare(&encoding, &gallery, tolerance),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("No faces found in {}", image_path.display());
        return Ok(());
    }
    for r in &reports {
        println!("{}", format_report(r));
    }
    Ok(())
}

fn enroll(
    dir: &Path,
    detector: &mut impl Detector,
    encoder: &mut impl Encoder,
    args: &ModelArgs,
) -> Result<Gallery> {
    Gallery::enroll_from_dir(dir, detector, encoder, args.thresholds)
        .with_context(|| format!("enrolling {}", dir.display()))
}

fn format_report(r: &FaceReport) -> String {
    let [l, t, rt, b] = r.region;
    let verdict = if r.result.accepted { "accept" } else { "reject" };
    format!(
        "  [{l},{t} {rt},{b}] score {:.2}  {:<16} distance {:.3}  {verdict}",
        r.score, r.result.name, r.result.distance
    )
}
