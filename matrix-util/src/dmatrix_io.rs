use crate::common_io::{read_lines_of_words_delim, write_lines, Delimiter};
use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};

use std::fmt::{Debug, Display};
use std::str::FromStr;

fn parse_row<T>(words: &[Box<str>], line_no: usize) -> anyhow::Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: Debug,
{
    words
        .iter()
        .map(|w| {
            w.parse::<T>().map_err(|e| {
                anyhow::anyhow!("line {}: failed to parse `{}` ({:?})", line_no, w, e)
            })
        })
        .collect()
}

impl<T> IoOps for DMatrix<T>
where
    T: nalgebra::Scalar + Send + Sync + FromStr + Display + Copy,
    <T as FromStr>::Err: Debug,
{
    type Scalar = T;
    type Mat = Self;

    fn read_data_with_names(
        file_path: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>> {
        let parsed = read_lines_of_words_delim(file_path, delim, Some(0))?;

        if parsed.lines.is_empty() {
            return Err(anyhow::anyhow!("no data rows in {}", file_path));
        }

        let ncols = parsed.lines[0].len().saturating_sub(1);
        if ncols == 0 {
            return Err(anyhow::anyhow!("no data columns in {}", file_path));
        }

        // the header may or may not name the row-name column
        let cols: Vec<Box<str>> = match parsed.header.len() {
            n if n == ncols => parsed.header,
            n if n == ncols + 1 => parsed.header[1..].to_vec(),
            n => {
                return Err(anyhow::anyhow!(
                    "header has {} names, but rows have {} values",
                    n,
                    ncols
                ))
            }
        };

        let nrows = parsed.lines.len();
        let mut rows = Vec::with_capacity(nrows);
        let mut data = Vec::with_capacity(nrows * ncols);

        for (i, words) in parsed.lines.iter().enumerate() {
            // +2: one for the header, one for 1-based numbering
            let line_no = i + 2;
            if words.len() != ncols + 1 {
                return Err(anyhow::anyhow!(
                    "line {}: expected {} fields, found {}",
                    line_no,
                    ncols + 1,
                    words.len()
                ));
            }
            rows.push(words[0].clone());
            data.extend(parse_row::<T>(&words[1..], line_no)?);
        }

        Ok(MatWithNames {
            rows,
            cols,
            mat: DMatrix::<T>::from_row_iterator(nrows, ncols, data),
        })
    }

    fn write_data_with_names(
        &self,
        file: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
        row_column_name: &str,
    ) -> anyhow::Result<()> {
        if rows.len() != self.nrows() || cols.len() != self.ncols() {
            return Err(anyhow::anyhow!(
                "names ({} x {}) don't match the matrix ({} x {})",
                rows.len(),
                cols.len(),
                self.nrows(),
                self.ncols()
            ));
        }

        let mut lines = Vec::with_capacity(self.nrows() + 1);

        let header = std::iter::once(row_column_name.to_string())
            .chain(cols.iter().map(|c| c.to_string()))
            .collect::<Vec<_>>()
            .join("\t");
        lines.push(header.into_boxed_str());

        for (name, row) in rows.iter().zip(self.row_iter()) {
            let line = std::iter::once(name.to_string())
                .chain(row.iter().map(|x| format!("{}", *x)))
                .collect::<Vec<_>>()
                .join("\t");
            lines.push(line.into_boxed_str());
        }

        write_lines(&lines, file)
    }

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<Self::Mat> {
        let data = read_lines_of_words_delim(tsv_file, delim, None)?.lines;

        if data.is_empty() {
            return Err(anyhow::anyhow!("No data in file"));
        }

        let ncols = data[0].len();
        let nrows = data.len();

        let mut values = Vec::with_capacity(nrows * ncols);
        for (i, words) in data.iter().enumerate() {
            if words.len() != ncols {
                return Err(anyhow::anyhow!(
                    "line {}: expected {} fields, found {}",
                    i + 1,
                    ncols,
                    words.len()
                ));
            }
            values.extend(parse_row::<T>(words, i + 1)?);
        }

        Ok(DMatrix::<T>::from_row_iterator(nrows, ncols, values))
    }

    fn write_file_delim(&self, tsv_file: &str, delim: &str) -> anyhow::Result<()> {
        // par_iter() or par_bridge() will
        // mess up the order of the rows
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines(&lines, tsv_file)?;
        Ok(())
    }
}
