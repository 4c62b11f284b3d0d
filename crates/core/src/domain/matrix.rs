//! Dense input × output gain table
//!
//! Stored row-major by input, which is also the layout the backend expects:
//! the flattened buffer is addressed as `input * outputs + output`.

use crate::domain::audio::{AudioError, Result};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T> {
    inputs: usize,
    outputs: usize,
    cells: Vec<T>,
}

impl<T: Clone> Matrix<T> {
    /// Build an `inputs × outputs` table with every cell set to `fill`
    pub fn new(inputs: usize, outputs: usize, fill: T) -> Self {
        Self {
            inputs,
            outputs,
            cells: vec![fill; inputs * outputs],
        }
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    /// Replace the whole table. Nothing is written unless every row fits.
    pub fn fill<R: AsRef<[T]>>(&mut self, table: &[R]) -> Result<()> {
        if table.len() != self.inputs {
            return Err(AudioError::DimensionMismatch {
                expected: self.inputs,
                actual: table.len(),
            });
        }
        if let Some(row) = table.iter().find(|row| row.as_ref().len() != self.outputs) {
            return Err(AudioError::DimensionMismatch {
                expected: self.outputs,
                actual: row.as_ref().len(),
            });
        }

        self.cells.clear();
        for row in table {
            self.cells.extend_from_slice(row.as_ref());
        }
        Ok(())
    }

    pub fn get(&self, input: usize, output: usize) -> Result<&T> {
        let idx = self.index(input, output)?;
        Ok(&self.cells[idx])
    }

    pub fn set_input(&mut self, input: usize, output: usize, value: T) -> Result<()> {
        let idx = self.index(input, output)?;
        self.cells[idx] = value;
        Ok(())
    }

    /// Same cell write as [`Matrix::set_input`], addressed output-first
    pub fn set_output(&mut self, output: usize, input: usize, value: T) -> Result<()> {
        self.set_input(input, output, value)
    }

    /// Replace the gains one input feeds to every output
    pub fn set_input_vector(&mut self, input: usize, values: &[T]) -> Result<()> {
        check_index(input, self.inputs)?;
        if values.len() != self.outputs {
            return Err(AudioError::DimensionMismatch {
                expected: self.outputs,
                actual: values.len(),
            });
        }

        let start = input * self.outputs;
        self.cells[start..start + self.outputs].clone_from_slice(values);
        Ok(())
    }

    /// Replace the gains every input feeds to one output
    pub fn set_output_vector(&mut self, output: usize, values: &[T]) -> Result<()> {
        check_index(output, self.outputs)?;
        if values.len() != self.inputs {
            return Err(AudioError::DimensionMismatch {
                expected: self.inputs,
                actual: values.len(),
            });
        }

        for (input, value) in values.iter().enumerate() {
            self.cells[input * self.outputs + output] = value.clone();
        }
        Ok(())
    }

    pub fn get_input_vector(&self, input: usize) -> Result<Vec<T>> {
        check_index(input, self.inputs)?;
        let start = input * self.outputs;
        Ok(self.cells[start..start + self.outputs].to_vec())
    }

    pub fn get_output_vector(&self, output: usize) -> Result<Vec<T>> {
        check_index(output, self.outputs)?;
        Ok((0..self.inputs)
            .map(|input| self.cells[input * self.outputs + output].clone())
            .collect())
    }

    /// Row-major view handed to the backend
    pub fn flatten(&self) -> &[T] {
        &self.cells
    }

    /// Copy of the table, one `Vec` per input
    pub fn rows(&self) -> Vec<Vec<T>> {
        if self.outputs == 0 {
            return vec![Vec::new(); self.inputs];
        }
        self.cells.chunks(self.outputs).map(<[T]>::to_vec).collect()
    }

    fn index(&self, input: usize, output: usize) -> Result<usize> {
        check_index(input, self.inputs)?;
        check_index(output, self.outputs)?;
        Ok(input * self.outputs + output)
    }
}

impl<T: Clone + AddAssign> Matrix<T> {
    /// Add `value` into a cell
    pub fn accumulate(&mut self, input: usize, output: usize, value: T) -> Result<()> {
        let idx = self.index(input, output)?;
        self.cells[idx] += value;
        Ok(())
    }
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(AudioError::OutOfRange { index, len });
    }
    Ok(())
}
