//! Label bookkeeping: maps arbitrary training labels onto dense class indices.
//!
//! Class indices follow the sorted order of the distinct labels, so the
//! same label set always produces the same numbering regardless of the order
//! examples appear in.

/// Dense class numbering for a fixed set of training labels.
#[derive(Debug, Clone)]
pub struct ClassIndex<L> {
    /// Distinct labels in ascending order; position = class index.
    unique: Vec<L>,
    /// Class index of every training example.
    example_classes: Vec<usize>,
    /// Example indices belonging to each class, in dataset order.
    class_examples: Vec<Vec<usize>>,
}

impl<L: Ord + Clone> ClassIndex<L> {
    /// Build the class index from one label per training example.
    pub fn new(labels: &[L]) -> Self {
        let mut unique: Vec<L> = labels.to_vec();
        unique.sort();
        unique.dedup();

        let mut class_examples = vec![Vec::new(); unique.len()];
        let example_classes: Vec<usize> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                // Every label is present in `unique` by construction.
                let class = unique.binary_search(label).unwrap_or_default();
                class_examples[class].push(i);
                class
            })
            .collect();

        Self {
            unique,
            example_classes,
            class_examples,
        }
    }

    /// Class index for a label, if the label was seen at construction.
    pub fn class_of_label(&self, label: &L) -> Option<usize> {
        self.unique.binary_search(label).ok()
    }
}

impl<L> ClassIndex<L> {
    /// Original label value for a class index.
    pub fn label(&self, class: usize) -> Option<&L> {
        self.unique.get(class)
    }

    /// Distinct labels in class-index order.
    pub fn labels(&self) -> &[L] {
        &self.unique
    }

    /// Number of distinct classes (`C`).
    pub fn num_classes(&self) -> usize {
        self.class_examples.len()
    }

    /// Number of training examples.
    pub fn num_examples(&self) -> usize {
        self.example_classes.len()
    }

    /// Class index of example `i`.
    pub fn class_of(&self, example: usize) -> usize {
        self.example_classes[example]
    }

    /// Class index of every example.
    pub fn example_classes(&self) -> &[usize] {
        &self.example_classes
    }

    /// Example indices belonging to `class`, in dataset order.
    pub fn examples_of(&self, class: usize) -> &[usize] {
        &self.class_examples[class]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_follow_sorted_label_order() {
        let idx = ClassIndex::new(&[7, 3, 7, 9, 3]);
        assert_eq!(idx.num_classes(), 3);
        assert_eq!(idx.labels(), &[3, 7, 9]);
        assert_eq!(idx.example_classes(), &[1, 0, 1, 2, 0]);
        assert_eq!(idx.examples_of(0), &[1, 4]);
        assert_eq!(idx.examples_of(1), &[0, 2]);
        assert_eq!(idx.examples_of(2), &[3]);
    }

    #[test]
    fn test_label_round_trip() {
        let idx = ClassIndex::new(&["cat", "dog", "cat"]);
        let class = idx.class_of_label(&"dog").unwrap();
        assert_eq!(idx.label(class), Some(&"dog"));
        assert!(idx.class_of_label(&"bird").is_none());
        assert!(idx.label(5).is_none());
    }
}
