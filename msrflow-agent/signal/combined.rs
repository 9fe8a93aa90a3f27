//! Arithmetic combiners over child signals

use crate::error::Result;

use super::{not_setup, Signal, SignalRef};

/// Quotient of two child signals; a zero denominator samples as NaN.
pub struct RatioSignal {
    numerator: SignalRef,
    denominator: SignalRef,
    is_batch_ready: bool,
}

impl RatioSignal {
    pub fn new(numerator: SignalRef, denominator: SignalRef) -> Self {
        Self {
            numerator,
            denominator,
            is_batch_ready: false,
        }
    }

    fn combine(num: f64, den: f64) -> f64 {
        if den == 0.0 {
            f64::NAN
        } else {
            num / den
        }
    }
}

impl Signal for RatioSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            self.numerator.borrow_mut().setup_batch()?;
            self.denominator.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        let num = self.numerator.borrow_mut().sample()?;
        let den = self.denominator.borrow_mut().sample()?;
        Ok(Self::combine(num, den))
    }

    fn read(&mut self) -> Result<f64> {
        let num = self.numerator.borrow_mut().read()?;
        let den = self.denominator.borrow_mut().read()?;
        Ok(Self::combine(num, den))
    }
}

/// Difference of two child signals, minuend minus subtrahend.
pub struct DifferenceSignal {
    minuend: SignalRef,
    subtrahend: SignalRef,
    is_batch_ready: bool,
}

impl DifferenceSignal {
    pub fn new(minuend: SignalRef, subtrahend: SignalRef) -> Self {
        Self {
            minuend,
            subtrahend,
            is_batch_ready: false,
        }
    }
}

impl Signal for DifferenceSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            self.minuend.borrow_mut().setup_batch()?;
            self.subtrahend.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        Ok(self.minuend.borrow_mut().sample()? - self.subtrahend.borrow_mut().sample()?)
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.minuend.borrow_mut().read()? - self.subtrahend.borrow_mut().read()?)
    }
}

/// Child signal scaled by a constant factor.
pub struct ProductSignal {
    child: SignalRef,
    factor: f64,
    is_batch_ready: bool,
}

impl ProductSignal {
    pub fn new(child: SignalRef, factor: f64) -> Self {
        Self {
            child,
            factor,
            is_batch_ready: false,
        }
    }
}

impl Signal for ProductSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            self.child.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        Ok(self.child.borrow_mut().sample()? * self.factor)
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.child.borrow_mut().read()? * self.factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::testing::MockSignal;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_ratio_zero_denominator_is_nan() {
        let (num, _, _) = MockSignal::shared(8.0);
        let (den, den_value, _) = MockSignal::shared(2.0);
        let mut ratio = RatioSignal::new(num, den);
        ratio.setup_batch().unwrap();
        assert_eq!(ratio.sample().unwrap(), 4.0);
        den_value.set(0.0);
        assert!(ratio.sample().unwrap().is_nan());
    }

    #[test]
    fn test_difference_and_product() {
        let (a, _, _) = MockSignal::shared(100.0);
        let (b, _, _) = MockSignal::shared(37.0);
        let mut diff = DifferenceSignal::new(a.clone(), b);
        diff.setup_batch().unwrap();
        assert_eq!(diff.sample().unwrap(), 63.0);

        let mut product = ProductSignal::new(a, 1e8);
        product.setup_batch().unwrap();
        assert_eq!(product.sample().unwrap(), 1e10);
    }

    #[test]
    fn test_setup_forwards_to_shared_child_once() {
        let (child, _, setup_count) = MockSignal::shared(1.0);
        let mut left = ProductSignal::new(child.clone(), 2.0);
        let mut right = ProductSignal::new(child.clone(), 3.0);
        left.setup_batch().unwrap();
        left.setup_batch().unwrap();
        right.setup_batch().unwrap();
        assert_eq!(setup_count.get(), 1);
    }

    #[test]
    fn test_sample_before_setup_fails() {
        let (a, _, _) = MockSignal::shared(1.0);
        let (b, _, _) = MockSignal::shared(1.0);
        let mut ratio = RatioSignal::new(a, b);
        assert!(ratio.sample().is_err());
    }
}
