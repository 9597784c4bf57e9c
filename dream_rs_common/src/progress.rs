use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Wrap an iterator in a progress bar. The const parameter picks the bar color:
/// `'b'` blue, `'g'` green, `'r'` red.
///
/// ```rust
/// use dream_rs_common::NiceProgressBar;
///
/// let mut total = 0;
/// for x in NiceProgressBar::<_, 'g'>([1, 2, 3].into_iter(), "Counting") {
///     total += x;
/// }
/// assert_eq!(total, 6);
/// ```
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'static str);

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let color = match COLOR {
            'b' => "blue",
            'g' => "green",
            'r' => "red",
            _ => "white",
        };
        let bar = ProgressBar::new(self.0.len() as u64);
        let style = ProgressStyle::default_bar()
            .template(&format!(
                "{}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})",
                self.1
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        self.0.progress_with(bar)
    }
}
