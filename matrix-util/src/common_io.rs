use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Define a Delimiter enum to handle both &str and `Vec<char>`
#[derive(Clone, Debug)]
pub enum Delimiter {
    Str(String),
    Chars(Vec<char>),
}

impl From<&str> for Delimiter {
    fn from(s: &str) -> Self {
        Delimiter::Str(s.to_string())
    }
}

impl From<Vec<char>> for Delimiter {
    fn from(chars: Vec<char>) -> Self {
        Delimiter::Chars(chars)
    }
}

impl From<&[char]> for Delimiter {
    fn from(chars: &[char]) -> Self {
        Delimiter::Chars(chars.to_vec())
    }
}

impl<const N: usize> From<&[char; N]> for Delimiter {
    fn from(chars: &[char; N]) -> Self {
        Delimiter::Chars(chars.to_vec())
    }
}

impl Delimiter {
    /// split a line into trimmed words; empty fields are dropped
    pub fn split_line(&self, line: &str) -> Vec<Box<str>> {
        let words: Vec<&str> = match self {
            Delimiter::Str(s) => line.split(s.as_str()).collect(),
            Delimiter::Chars(chars) => line.split(chars.as_slice()).collect(),
        };
        words
            .into_iter()
            .map(|w| w.trim().trim_matches('"'))
            .filter(|w| !w.is_empty())
            .map(|w| w.to_owned().into_boxed_str())
            .collect()
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines(lines: &[Box<str>], output_file_path: &str) -> anyhow::Result<()> {
    write_types(lines, output_file_path)
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_types<T>(lines: &[T], output_file_path: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file_path)?;
    for line in lines {
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            } else {
                return Err(anyhow::anyhow!("unexpected error: {}", e));
            }
        }
    }
    buf.flush()?;
    Ok(())
}

pub struct ReadLinesOut<T: Send> {
    pub lines: Vec<Vec<T>>,
    pub header: Vec<Box<str>>,
}

fn is_not_comment_line(line: &str) -> bool {
    !(line.starts_with('#') || line.starts_with('%') || line.trim().is_empty())
}

///
/// Read lines and split them into words; the header line (if any)
/// is kept separately.
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - delimiter
/// * `hdr_line` - location of a header line (None = no header line)
///
pub fn read_lines_of_words_delim(
    input_file: &str,
    delim: impl Into<Delimiter>,
    hdr_line: Option<usize>,
) -> anyhow::Result<ReadLinesOut<Box<str>>> {
    let delim = delim.into();
    let buf_reader: Box<dyn BufRead> = open_buf_reader(input_file)?;

    let lines_raw: Vec<Box<str>> = buf_reader
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|x| x.into_boxed_str())
        .filter(|x| is_not_comment_line(x.as_ref()))
        .collect();

    let (header, body) = match hdr_line {
        Some(n_skip) => {
            if lines_raw.len() < n_skip + 1 {
                return Err(anyhow::anyhow!("not enough lines in {}", input_file));
            }
            (
                delim.split_line(&lines_raw[n_skip]),
                &lines_raw[(n_skip + 1)..],
            )
        }
        None => (vec![], &lines_raw[..]),
    };

    // Parsing takes more time, so split them into parallel jobs;
    // `par_iter` on a slice keeps the order
    let lines = body
        .par_iter()
        .map(|s| delim.split_line(s))
        .collect::<Vec<_>>();

    Ok(ReadLinesOut { lines, header })
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn std::io::Write>> {
    // we can simply override with stdout
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(std::io::BufWriter::new(std::io::stdout())));
    }

    if output_file.eq_ignore_ascii_case("stderr") {
        return Ok(Box::new(std::io::BufWriter::new(std::io::stderr())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Create a directory if needed
/// * `dir` - directory name
///
pub fn mkdir(dir: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

///
/// Join a directory and a file name into a `String` path
///
pub fn join_path(dir: &str, file: &str) -> String {
    Path::new(dir).join(file).to_string_lossy().into_owned()
}

///
/// Create a temporary directory and suggest a file name
/// * `suffix` - suffix of the file name
///
pub fn create_temp_dir_file(suffix: &str) -> anyhow::Result<std::path::PathBuf> {
    let temp_dir = tempfile::tempdir()?.path().to_path_buf();
    std::fs::create_dir_all(&temp_dir)?;
    let temp_file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile_in(temp_dir)?
        .path()
        .to_owned();

    Ok(temp_file)
}
