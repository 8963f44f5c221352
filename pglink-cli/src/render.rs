use std::io::Write;

/// Presentation contract. Commands hand rows to a renderer and stay out of
/// the formatting business.
pub trait Render {
    fn table(&mut self, title: &str, headers: &[&str], rows: &[Vec<String>]);
    fn message(&mut self, text: &str);
}

/// Plain aligned-text renderer.
pub struct TextRenderer<W: Write> {
    out: W,
}

impl<W: Write> TextRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Render for TextRenderer<W> {
    fn table(&mut self, title: &str, headers: &[&str], rows: &[Vec<String>]) {
        let _ = writeln!(self.out, "\n{title}\n");

        if rows.is_empty() {
            let _ = writeln!(self.out, "(none)");
            return;
        }

        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() && cell.len() > widths[i] {
                    widths[i] = cell.len();
                }
            }
        }

        let header_line = headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{h:<width$}", width = widths[i]))
            .collect::<Vec<_>>()
            .join(" | ");
        let _ = writeln!(self.out, "{header_line}");

        let separator = widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-");
        let _ = writeln!(self.out, "{separator}");

        for row in rows {
            let line = row
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let width = widths.get(i).copied().unwrap_or(0);
                    format!("{cell:<width$}")
                })
                .collect::<Vec<_>>()
                .join(" | ");
            let _ = writeln!(self.out, "{}", line.trim_end());
        }
    }

    fn message(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(headers: &[&str], rows: &[Vec<String>]) -> String {
        let mut out = Vec::new();
        TextRenderer::new(&mut out).table("Things", headers, rows);

        String::from_utf8(out).unwrap()
    }

    #[test]
    fn columns_align_to_the_widest_cell() {
        let output = rendered(
            &["Name", "Enabled"],
            &[
                vec!["sub1".to_owned(), "true".to_owned()],
                vec!["a_much_longer_name".to_owned(), "false".to_owned()],
            ],
        );

        assert!(output.contains("Name               | Enabled"));
        assert!(output.contains("sub1               | true"));
        assert!(output.contains("a_much_longer_name | false"));
    }

    #[test]
    fn empty_tables_render_a_placeholder() {
        let output = rendered(&["Name"], &[]);

        assert!(output.contains("Things"));
        assert!(output.contains("(none)"));
    }
}
