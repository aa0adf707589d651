use std::path::Path;

use rust_xlsxwriter::Workbook;

use crate::student::{Student, EDITABLE_FIELDS};

/// Write the roster as a single-sheet workbook: one header row over the
/// editable columns plus the verification state, one row per student.
pub fn export_students(students: &[Student], out_path: &Path) -> anyhow::Result<usize> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();

    let mut col = 0u16;
    for name in EDITABLE_FIELDS {
        worksheet.write_string(0, col, *name)?;
        col += 1;
    }
    worksheet.write_string(0, col, "is_verified")?;
    worksheet.write_string(0, col + 1, "verified_at")?;

    for (i, s) in students.iter().enumerate() {
        let row = (i + 1) as u32;
        let mut col = 0u16;
        for name in EDITABLE_FIELDS {
            let v = s.field_value(name).unwrap_or(None);
            worksheet.write_string(row, col, v.as_deref().unwrap_or(""))?;
            col += 1;
        }
        worksheet.write_string(row, col, if s.is_verified { "1" } else { "0" })?;
        worksheet.write_string(row, col + 1, s.verified_at.as_deref().unwrap_or(""))?;
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    workbook.save(out_path)?;
    Ok(students.len())
}
