//! Property tests for insertion bookkeeping.

use decl_annotate::edit::{Edit, EditSet};
use proptest::prelude::*;
use std::path::Path;

fn insertions() -> impl Strategy<Value = (String, Vec<(usize, String)>)> {
    "[a-z {};\n]{0,64}".prop_flat_map(|content| {
        let len = content.len();
        let edit = (0..=len, "[A-Z/*]{1,8}");
        (Just(content), prop::collection::vec(edit, 0..16))
    })
}

proptest! {
    #[test]
    fn applied_length_is_original_plus_insertions((content, edits) in insertions()) {
        let file = Path::new("prop.cpp");
        let mut set = EditSet::new();
        set.track_file(file, &content).unwrap();

        // unique text per edit so nothing collapses as a duplicate
        let tagged: Vec<(usize, String)> = edits
            .into_iter()
            .enumerate()
            .map(|(i, (offset, text))| (offset, format!("{text}{i}")))
            .collect();
        for (offset, text) in &tagged {
            set.insert(Edit::insertion(file, *offset, text.clone())).unwrap();
        }

        let buffer = set.apply(file, &content).unwrap();
        let added: usize = tagged.iter().map(|(_, t)| t.len()).sum();
        prop_assert_eq!(buffer.bytes.len(), content.len() + added);

        // each insertion lands at its original-coordinate offset, ties in arrival order
        let mut ordered = tagged.clone();
        ordered.sort_by_key(|(offset, _)| *offset);
        let mut expected = String::new();
        let mut last = 0;
        for (offset, text) in &ordered {
            expected.push_str(&content[last..*offset]);
            expected.push_str(text);
            last = *offset;
        }
        expected.push_str(&content[last..]);
        prop_assert_eq!(buffer.text(), expected);
    }

    #[test]
    fn serialization_is_sorted_by_offset((content, edits) in insertions()) {
        let file = Path::new("prop.cpp");
        let mut set = EditSet::new();
        set.track_file(file, &content).unwrap();
        for (i, (offset, text)) in edits.into_iter().enumerate() {
            set.insert(Edit::insertion(file, offset, format!("{text}{i}"))).unwrap();
        }

        let offsets: Vec<usize> = set.iter().map(|e| e.byte_start).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        prop_assert_eq!(offsets, sorted);
        prop_assert_eq!(set.serialize().lines().count(), set.len());
    }
}
