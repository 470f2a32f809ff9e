use crate::common_io::Delimiter;
use candle_util::candle_core::{Device, Tensor};

/// A matrix with row and column names
pub struct MatWithNames<T> {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: T,
}

/// Reading off from `Tensor`
pub trait ConvertMatOps {
    type Mat;
    type Scalar;

    fn from_tensor(_: &Tensor) -> anyhow::Result<Self::Mat>;
    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor>;
}

/// Column-wise summary statistics
pub trait ColumnStatOps {
    type DVec;

    /// mean of each column
    fn column_means(&self) -> Self::DVec;

    /// unbiased standard deviation of each column
    fn column_stds(&self) -> Self::DVec;
}

/// Operations to sample random matrices
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif(dd: usize, nn: usize) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm(dd: usize, nn: usize) -> Self::Mat;

    /// Sample a count matrix from `Poisson(rate[i,j])`
    fn rpois(rate: &Self::Mat) -> anyhow::Result<Self::Mat>;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    /// Read a delimited file with a header line of column names and
    /// a leading column of row names. The header may or may not
    /// carry a name for the row-name column.
    ///
    /// * `file` - file name--either gzipped or not
    /// * `delim` - delimiter(s)
    fn read_data_with_names(
        file: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>>;

    /// Write a delimited file with row and column names
    ///
    /// * `file` - file name--either gzipped or not
    /// * `rows` - row names
    /// * `cols` - column names
    /// * `row_column_name` - name of the leading column
    fn write_data_with_names(
        &self,
        file: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
        row_column_name: &str,
    ) -> anyhow::Result<()>;

    fn read_file_delim(file: &str, delim: impl Into<Delimiter>) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t")
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    fn to_csv(&self, csv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(csv_file, ",")
    }
}
