/*!
CSV export for [`Sample`] blocks, available behind the `csv` feature.

The layout is one row per draw: a running index, the state coordinates as
`dim_0`, `dim_1`, ..., and one trailing column per attached annotation
(`pdf`, `pot`, `weight`), in that order.
*/

use std::error::Error;
use std::fs::File;

use csv::Writer;

use crate::sample::Sample;

/// Writes a [`Sample`] to `filename` as CSV.
///
/// Columns for `pdf`, `pot`, and `weight` appear only when the sample
/// carries the corresponding array.
///
/// # Examples
///
/// ```rust
/// use mc3::io::save_csv;
/// use mc3::sample::Sample;
/// use ndarray::array;
///
/// let sample = Sample::new(array![[0.5, 1.5], [0.25, 2.5]]);
/// save_csv(&sample, "/tmp/sample.csv")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn save_csv(sample: &Sample, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header: Vec<String> = vec!["sample".to_string()];
    header.extend((0..sample.ndim()).map(|i| format!("dim_{i}")));
    if sample.pdf().is_some() {
        header.push("pdf".to_string());
    }
    if sample.pot().is_some() {
        header.push("pot".to_string());
    }
    if sample.weights().is_some() {
        header.push("weight".to_string());
    }
    wtr.write_record(&header)?;

    for (idx, row) in sample.data().outer_iter().enumerate() {
        let mut record = vec![idx.to_string()];
        record.extend(row.iter().map(|value| value.to_string()));
        if let Some(pdf) = sample.pdf() {
            record.push(pdf[idx].to_string());
        }
        if let Some(pot) = sample.pot() {
            record.push(pot[idx].to_string());
        }
        if let Some(weights) = sample.weights() {
            record.push(weights[idx].to_string());
        }
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(())
}
