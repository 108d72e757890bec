use crate::models::{CANONICAL_SECTION_ORDER, KeywordCoverage, ListingJob, Review};

/// Flat-text rendering of a listing, ready to paste into Seller Central.
/// Sections come out in canonical order; sections without final text are
/// skipped rather than rendered blank.
pub fn listing_text(job: &ListingJob) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# {} ({})\n",
        job.product.name,
        job.marketplace.domain()
    ));
    out.push_str(&format!("Status: {}\n\n", job.phase.label()));

    for section_type in CANONICAL_SECTION_ORDER {
        let Some(section) = job.section(section_type) else {
            continue;
        };
        if section.final_text.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{}:\n{}\n\n",
            section_type.display_name(),
            section.final_text
        ));
    }

    out.push_str(&coverage_footer(&job.coverage));
    out
}

fn coverage_footer(coverage: &KeywordCoverage) -> String {
    format!(
        "Keyword coverage: {}% ({} placed, {} remaining)\n",
        coverage.coverage_score,
        coverage.placed.len(),
        coverage.remaining.len()
    )
}

pub fn reviews_csv(reviews: &[Review]) -> String {
    let mut out = String::from("asin,title,body,rating,author,date\n");
    for review in reviews {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_field(&review.asin),
            csv_field(&review.title),
            csv_field(&review.body),
            review.rating,
            csv_field(&review.author),
            csv_field(review.date.as_deref().unwrap_or("")),
        ));
    }
    out
}

pub fn coverage_csv(coverage: &KeywordCoverage) -> String {
    let mut out = String::from("keyword,relevance,status,location\n");
    for placed in &coverage.placed {
        out.push_str(&format!(
            "{},{},placed,{}\n",
            csv_field(&placed.keyword),
            placed.relevance,
            placed.placed_in.display_name(),
        ));
    }
    for remaining in &coverage.remaining {
        out.push_str(&format!(
            "{},{},remaining,{}\n",
            csv_field(&remaining.keyword),
            remaining.relevance,
            match remaining.tier {
                crate::models::PriorityTier::High => "high",
                crate::models::PriorityTier::Medium => "medium",
                crate::models::PriorityTier::Low => "low",
            },
        ));
    }
    out
}

/// RFC 4180 quoting: fields containing commas, quotes, or newlines are
/// wrapped in double quotes with embedded quotes doubled.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        KeywordScore, Marketplace, PlacedKeyword, ProductDetails, RemainingKeyword, Section,
        SectionType,
    };

    fn sample_job() -> ListingJob {
        let mut job = ListingJob::new(
            ProductDetails {
                name: "Cork Yoga Mat".into(),
                brand: Some("Flexi".into()),
                category: None,
                features: vec![],
                asin: None,
            },
            vec![KeywordScore {
                keyword: "yoga mat".into(),
                relevance: 0.9,
            }],
            Marketplace::AmazonUs,
        );
        let mut title = Section::draft(SectionType::Title, vec!["Cork Yoga Mat by Flexi".into()]);
        title.final_text = "Cork Yoga Mat by Flexi".into();
        title.approved = true;
        let mut bullet = Section::draft(SectionType::Bullet1, vec!["Grippy surface".into()]);
        bullet.final_text = "Grippy surface".into();
        // Description drafted but never filled in; it must not render.
        let description = Section::draft(SectionType::Description, vec!["Long copy".into()]);
        job.sections = vec![description, bullet, title];
        job.coverage.placed = vec![PlacedKeyword {
            keyword: "yoga mat".into(),
            relevance: 0.9,
            placed_in: SectionType::Title,
        }];
        job.coverage.coverage_score = 100;
        job
    }

    #[test]
    fn listing_text_renders_sections_in_canonical_order() {
        let text = listing_text(&sample_job());
        let title_at = text.find("Title:").expect("title present");
        let bullet_at = text.find("Bullet 1:").expect("bullet present");
        assert!(title_at < bullet_at, "title renders before bullets");
        assert!(!text.contains("Description:"), "empty section skipped");
        assert!(text.contains("Keyword coverage: 100% (1 placed, 0 remaining)"));
        assert!(text.starts_with("# Cork Yoga Mat (amazon.com)"));
    }

    #[test]
    fn csv_doubles_embedded_quotes_and_wraps_commas() {
        let reviews = vec![Review {
            asin: "B00EXAMPLE".into(),
            title: "Best \"mat\" ever".into(),
            body: "Grippy, light,\nand durable".into(),
            rating: 4.5,
            author: "Sam".into(),
            date: None,
        }];
        let csv = reviews_csv(&reviews);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("asin,title,body,rating,author,date"));
        let row = &csv[csv.find('\n').unwrap() + 1..];
        assert!(row.contains("\"Best \"\"mat\"\" ever\""));
        assert!(row.contains("\"Grippy, light,\nand durable\""));
        assert!(row.starts_with("B00EXAMPLE,"));
    }

    #[test]
    fn plain_fields_are_not_quoted() {
        let reviews = vec![Review {
            asin: "B000000001".into(),
            title: "Solid".into(),
            body: "Does the job".into(),
            rating: 4.0,
            author: "Alex".into(),
            date: Some("2026-01-15".into()),
        }];
        let csv = reviews_csv(&reviews);
        assert!(csv.contains("B000000001,Solid,Does the job,4,Alex,2026-01-15"));
    }

    #[test]
    fn coverage_csv_lists_placed_then_remaining() {
        let coverage = KeywordCoverage {
            placed: vec![PlacedKeyword {
                keyword: "yoga mat".into(),
                relevance: 0.9,
                placed_in: SectionType::Title,
            }],
            remaining: vec![RemainingKeyword {
                keyword: "non slip".into(),
                relevance: 0.5,
                tier: crate::models::PriorityTier::Medium,
            }],
            coverage_score: 50,
        };
        let csv = coverage_csv(&coverage);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "keyword,relevance,status,location");
        assert_eq!(lines[1], "yoga mat,0.9,placed,Title");
        assert_eq!(lines[2], "non slip,0.5,remaining,medium");
    }
}
