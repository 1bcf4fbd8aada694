/// Runs the provided closure and logs how long it took.
/// The $msg param is a label that makes the timing easy to find in the log,
/// the optional $level param picks the log level (`Debug` by default).
///
/// # Example
///
/// ```no run
/// # fn main {
///     let model = measure_time!("loading model", || load(path), log::Level::Info)?;
/// #}
#[macro_export]
macro_rules! measure_time {
    ($msg: expr, $fn: expr) => {
        $crate::measure_time!($msg, $fn, log::Level::Debug)
    };
    ($msg: expr, $fn: expr, $level: expr) => {{
        let instant = std::time::Instant::now();
        let res = $fn();
        log::log!(
            $level,
            "Finished \"{}\" in {} ms",
            $msg,
            instant.elapsed().as_millis(),
        );
        res
    }};
}
