use anyhow::{Context, Result};
use csv::Writer;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};
use tracing::info;

use crate::{
    common::{delete_if_exists, ensure_parent_dir, promote_tmp, tmp_path_for},
    model::{CodeNode, FlatRecord, SearchHit},
    relations::RelationReport,
    walker::FailedLookup,
};

const MAX_SHEET_NAME_LEN: usize = 31;

/// Writes a CSV through a `.tmp` sibling and renames it into place once complete.
fn write_csv_atomically<F>(output_path: &Path, fallback_name: &str, write_rows: F) -> Result<()>
where
    F: FnOnce(&mut Writer<File>) -> Result<()>,
{
    ensure_parent_dir(output_path)?;
    let tmp_path = tmp_path_for(output_path, fallback_name);

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    if let Err(err) = write_rows(&mut writer) {
        drop(writer);
        let _ = delete_if_exists(&tmp_path);
        return Err(err);
    }
    writer
        .flush()
        .with_context(|| format!("Failed flushing {}", tmp_path.display()))?;
    drop(writer);
    promote_tmp(&tmp_path, output_path)
}

pub fn write_records_csv(records: &[FlatRecord], output_path: &Path) -> Result<()> {
    write_csv_atomically(output_path, "codes.csv", |writer| {
        writer
            .write_record(FlatRecord::COLUMNS)
            .context("Failed writing code export header")?;
        for record in records {
            let row: Vec<String> = record
                .row()
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect();
            writer
                .write_record(&row)
                .with_context(|| format!("Failed writing code export row for {}", record.code))?;
        }
        Ok(())
    })?;
    info!(rows = records.len(), path = %output_path.display(), "wrote code CSV");
    Ok(())
}

/// Excel sheet names: at most 31 characters, none of `[]:*?/\`, no leading or
/// trailing apostrophe, never empty.
pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_SHEET_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'').trim();
    if cleaned.is_empty() {
        "Sheet1".to_string()
    } else {
        cleaned.to_string()
    }
}

fn write_header(sheet: &mut Worksheet, columns: &[&str], bold: &Format) -> Result<()> {
    for (col, name) in columns.iter().enumerate() {
        sheet
            .write_string_with_format(0, col as u16, *name, bold)
            .context("Failed writing XLSX header")?;
    }
    sheet
        .set_freeze_panes(1, 0)
        .context("Failed freezing XLSX header row")?;
    Ok(())
}

fn save_workbook(workbook: &mut Workbook, output_path: &Path, fallback_name: &str) -> Result<()> {
    ensure_parent_dir(output_path)?;
    let tmp_path = tmp_path_for(output_path, fallback_name);
    workbook
        .save(&tmp_path)
        .with_context(|| format!("Failed saving workbook {}", tmp_path.display()))?;
    promote_tmp(&tmp_path, output_path)
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Empty,
    Number(f64),
    Flag(bool),
    Text(String),
}

/// Typed workbook cells for one record, in `FlatRecord::COLUMNS` order.
fn record_cells(record: &FlatRecord) -> Vec<Cell> {
    FlatRecord::COLUMNS
        .iter()
        .zip(record.row())
        .map(|(&column, value)| match (column, value) {
            (_, None) => Cell::Empty,
            ("depth", Some(_)) => Cell::Number(record.depth as f64),
            ("child_count", Some(_)) => Cell::Number(record.child_count as f64),
            ("is_leaf", Some(_)) => Cell::Flag(record.is_leaf),
            (_, Some(text)) => Cell::Text(text),
        })
        .collect()
}

pub fn write_records_xlsx(
    records: &[FlatRecord],
    output_path: &Path,
    sheet_name: &str,
) -> Result<()> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet
        .set_name(sanitize_sheet_name(sheet_name))
        .context("Failed naming XLSX sheet")?;
    write_header(sheet, &FlatRecord::COLUMNS, &bold)?;

    for (idx, record) in records.iter().enumerate() {
        let row = idx as u32 + 1;
        for (col, cell) in record_cells(record).into_iter().enumerate() {
            let col = col as u16;
            match cell {
                Cell::Empty => {}
                Cell::Number(number) => {
                    sheet
                        .write_number(row, col, number)
                        .context("Failed writing XLSX number")?;
                }
                Cell::Flag(flag) => {
                    sheet
                        .write_boolean(row, col, flag)
                        .context("Failed writing XLSX boolean")?;
                }
                Cell::Text(text) => {
                    sheet
                        .write_string(row, col, text)
                        .context("Failed writing XLSX cell")?;
                }
            }
        }
    }
    sheet.autofit();

    save_workbook(&mut workbook, output_path, "codes.xlsx")?;
    info!(rows = records.len(), path = %output_path.display(), "wrote code workbook");
    Ok(())
}

pub fn write_tree_json(tree: &CodeNode, output_path: &Path) -> Result<()> {
    ensure_parent_dir(output_path)?;
    let tmp_path = tmp_path_for(output_path, "hierarchy.json");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, tree)
        .with_context(|| format!("Failed serializing tree to {}", tmp_path.display()))?;
    out.flush()
        .with_context(|| format!("Failed flushing {}", tmp_path.display()))?;
    drop(out);
    promote_tmp(&tmp_path, output_path)?;
    info!(nodes = tree.node_count(), path = %output_path.display(), "saved hierarchy");
    Ok(())
}

pub fn load_tree_json(path: &Path) -> Result<CodeNode> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed parsing hierarchy JSON {}", path.display()))
}

/// Union of all hit fields, in first-seen order.
pub fn search_columns(hits: &[SearchHit]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for hit in hits {
        for key in hit.fields.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

pub fn write_search_csv(hits: &[SearchHit], output_path: &Path) -> Result<()> {
    let columns = search_columns(hits);
    write_csv_atomically(output_path, "search.csv", |writer| {
        writer
            .write_record(&columns)
            .context("Failed writing search export header")?;
        for hit in hits {
            writer
                .write_record(columns.iter().map(|c| hit.get(c).unwrap_or("")))
                .context("Failed writing search export row")?;
        }
        Ok(())
    })?;
    info!(
        rows = hits.len(),
        columns = columns.len(),
        path = %output_path.display(),
        "wrote search CSV"
    );
    Ok(())
}

pub fn write_search_xlsx(hits: &[SearchHit], output_path: &Path, sheet_name: &str) -> Result<()> {
    let columns = search_columns(hits);
    let header: Vec<&str> = columns.iter().map(String::as_str).collect();

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet
        .set_name(sanitize_sheet_name(sheet_name))
        .context("Failed naming XLSX sheet")?;
    write_header(sheet, &header, &bold)?;

    for (idx, hit) in hits.iter().enumerate() {
        for (col, name) in columns.iter().enumerate() {
            if let Some(value) = hit.get(name) {
                sheet
                    .write_string(idx as u32 + 1, col as u16, value)
                    .context("Failed writing XLSX cell")?;
            }
        }
    }
    sheet.autofit();

    save_workbook(&mut workbook, output_path, "search.xlsx")?;
    info!(rows = hits.len(), path = %output_path.display(), "wrote search workbook");
    Ok(())
}

pub fn write_failures_csv(failures: &[FailedLookup], output_path: &Path) -> Result<()> {
    write_csv_atomically(output_path, "failures.csv", |writer| {
        writer
            .write_record(["code", "target", "depth", "kind", "attempts", "message"])
            .context("Failed writing failures report header")?;
        for failure in failures {
            writer
                .write_record([
                    failure.code.as_str(),
                    failure.target.as_str(),
                    failure.depth.to_string().as_str(),
                    failure.kind.as_str(),
                    failure.attempts.to_string().as_str(),
                    failure.message.as_str(),
                ])
                .context("Failed writing failures report row")?;
        }
        Ok(())
    })?;
    info!(rows = failures.len(), path = %output_path.display(), "wrote failures report");
    Ok(())
}

pub fn write_relation_report_json(report: &RelationReport, output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .with_context(|| format!("Failed serializing relationship report for {}", report.code))?;
    write_text_file(output_path, &json)
}

/// Two sheets: the related codes, and the analyzed code's own details.
pub fn write_relation_report_xlsx(report: &RelationReport, output_path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet
        .set_name("Relationships")
        .context("Failed naming XLSX sheet")?;
    write_header(sheet, &["code", "name", "distance", "relationship_type"], &bold)?;
    for (idx, related) in report.related.iter().enumerate() {
        let row = idx as u32 + 1;
        sheet
            .write_string(row, 0, &related.code)
            .and_then(|s| s.write_string(row, 1, related.name.as_deref().unwrap_or("")))
            .and_then(|s| s.write_number(row, 2, related.distance as f64))
            .and_then(|s| s.write_string(row, 3, related.relationship.as_str()))
            .context("Failed writing relationship row")?;
    }
    sheet.autofit();

    let details = &report.details;
    let properties = [
        ("code", Some(report.code.as_str())),
        ("name", Some(details.name.as_str())),
        ("status", Some(details.status.as_str())),
        ("parent", details.parent.as_deref()),
        ("includes", details.includes.as_deref()),
        ("excludes", details.excludes.as_deref()),
    ];
    let sheet = workbook.add_worksheet();
    sheet
        .set_name("Code Details")
        .context("Failed naming XLSX sheet")?;
    write_header(sheet, &["property", "value"], &bold)?;
    for (idx, (property, value)) in properties.iter().enumerate() {
        let row = idx as u32 + 1;
        sheet
            .write_string(row, 0, *property)
            .and_then(|s| s.write_string(row, 1, value.unwrap_or("")))
            .context("Failed writing code detail row")?;
    }
    sheet.autofit();

    save_workbook(&mut workbook, output_path, "relationships.xlsx")?;
    info!(
        rows = report.related.len(),
        path = %output_path.display(),
        "wrote relationship workbook"
    );
    Ok(())
}

/// Writes `contents` to `output_path` through a `.tmp` sibling.
pub fn write_text_file(output_path: &Path, contents: &str) -> Result<()> {
    ensure_parent_dir(output_path)?;
    let tmp_path = tmp_path_for(output_path, "output.txt");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
    promote_tmp(&tmp_path, output_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::FailureKind,
        flatten::extract_all_codes,
        walker::LookupTarget,
    };
    use std::collections::BTreeMap;

    fn sample_tree() -> CodeNode {
        let mut root = CodeNode::new("F32");
        root.name = "Depressiv episode".into();
        let mut mild = CodeNode::new("F32.0");
        mild.name = "Lett depressiv episode, \"enkel\"".into();
        mild.includes = Some("a; b".into());
        root.children = vec![mild, CodeNode::new("F32.1")];
        root
    }

    #[test]
    fn workbook_cells_use_record_numbers_and_flags() {
        let records = extract_all_codes(&sample_tree());
        let root = record_cells(&records[0]);
        assert_eq!(root.len(), FlatRecord::COLUMNS.len());
        assert_eq!(root[0], Cell::Text("F32".into()));
        assert_eq!(root[3], Cell::Number(0.0));
        assert_eq!(root[4], Cell::Empty);
        assert_eq!(root[7], Cell::Flag(false));
        assert_eq!(root[8], Cell::Number(2.0));

        let mild = record_cells(&records[1]);
        assert_eq!(mild[3], Cell::Number(1.0));
        assert_eq!(mild[7], Cell::Flag(true));
        assert_eq!(mild[8], Cell::Number(0.0));
    }

    #[test]
    fn csv_has_header_and_one_row_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").join("codes.csv");
        let records = extract_all_codes(&sample_tree());
        write_records_csv(&records, &out).unwrap();

        assert!(!tmp_path_for(&out, "codes.csv").exists());
        let mut reader = csv::Reader::from_path(&out).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), FlatRecord::COLUMNS.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[1][0], "F32.0");
        assert_eq!(&rows[1][1], "Lett depressiv episode, \"enkel\"");
        assert_eq!(&rows[1][6], "F32 > F32.0");
        assert_eq!(&rows[0][4], "");
    }

    #[test]
    fn sheet_names_follow_excel_rules() {
        assert_eq!(sanitize_sheet_name("ICD-10 codes"), "ICD-10 codes");
        assert_eq!(sanitize_sheet_name("a/b:c?"), "a_b_c_");
        assert_eq!(sanitize_sheet_name(&"x".repeat(40)).chars().count(), 31);
        assert_eq!(sanitize_sheet_name("  "), "Sheet1");
        assert_eq!(sanitize_sheet_name("'quoted'"), "quoted");
    }

    #[test]
    fn xlsx_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let records = extract_all_codes(&sample_tree());
        let out = dir.path().join("codes.xlsx");
        write_records_xlsx(&records, &out, "Finnkode [icd10] hierarchy export").unwrap();
        assert!(fs::metadata(&out).unwrap().len() > 0);

        let hits = vec![SearchHit {
            fields: BTreeMap::from([("code".to_string(), "F32".to_string())]),
        }];
        let out = dir.path().join("search.xlsx");
        write_search_xlsx(&hits, &out, "search").unwrap();
        assert!(out.exists());
    }

    #[test]
    fn tree_json_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tree.json");
        let tree = sample_tree();
        write_tree_json(&tree, &out).unwrap();
        assert_eq!(load_tree_json(&out).unwrap(), tree);
    }

    #[test]
    fn search_export_uses_union_of_fields() {
        let hits = vec![
            SearchHit {
                fields: BTreeMap::from([
                    ("code".to_string(), "F32".to_string()),
                    ("term".to_string(), "Depresjon".to_string()),
                ]),
            },
            SearchHit {
                fields: BTreeMap::from([
                    ("code".to_string(), "F33".to_string()),
                    ("oid_system".to_string(), "icd10".to_string()),
                ]),
            },
        ];
        assert_eq!(search_columns(&hits), vec!["code", "term", "oid_system"]);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("search.csv");
        write_search_csv(&hits, &out).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["code,term,oid_system", "F32,Depresjon,", "F33,,icd10"]);
    }

    #[test]
    fn failures_report_lists_each_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("failures.csv");
        let failures = vec![FailedLookup {
            code: "F32.9".into(),
            target: LookupTarget::Children,
            depth: 2,
            kind: FailureKind::Transient,
            message: "request timed out".into(),
            attempts: 5,
        }];
        write_failures_csv(&failures, &out).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![
                "code,target,depth,kind,attempts,message",
                "F32.9,children,2,transient,5,request timed out"
            ]
        );
    }

    #[test]
    fn relation_report_written_as_json_and_xlsx() {
        use crate::{
            model::CodeStatus,
            relations::{CodeDetails, CodeGraph, RelationReport},
        };

        let records = extract_all_codes(&sample_tree());
        let graph = CodeGraph::from_records(&records);
        let details = CodeDetails {
            name: "Depressiv episode".into(),
            status: CodeStatus::Active,
            parent: None,
            includes: None,
            excludes: None,
        };
        let report = RelationReport::build(&graph, "F32", details, 1, 1_700_000_000);

        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("F32_relationships.json");
        write_relation_report_json(&report, &json_path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(value["code"], "F32");
        assert_eq!(value["related"].as_array().unwrap().len(), 3);

        let xlsx_path = dir.path().join("F32_relationships.xlsx");
        write_relation_report_xlsx(&report, &xlsx_path).unwrap();
        assert!(xlsx_path.exists());
    }
}
