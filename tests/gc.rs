mod common;

mod gc {
    use crate::common;
    use gd_nvds::error::Error;
    use gd_nvds::{Key, Nvds, Region};
    use pretty_assertions::assert_eq;

    const NS: Key = Key::from_str("counters");

    fn region(flash: &common::Flash) -> Region {
        Region::new(0, flash.len() as u32, "test").unwrap()
    }

    fn key(i: u32) -> Key {
        Key::try_from_str(&format!("counter{i}")).unwrap()
    }

    #[test]
    fn live_values_survive_collection() {
        let mut flash = common::Flash::new(3);
        let region = region(&flash);
        let nvds = Nvds::new(region.clone(), &mut flash).unwrap();

        for round in 0..100u32 {
            for i in 0..10 {
                nvds.set(Some(&NS), &key(i), round * 100 + i).unwrap();
            }
        }
        nvds.delete(Some(&NS), &key(3)).unwrap();
        nvds.delete(Some(&NS), &key(7)).unwrap();

        // keep writing after the deletes so their pages get collected as well
        for round in 100..150u32 {
            for i in [0, 1, 2] {
                nvds.set(Some(&NS), &key(i), round * 100 + i).unwrap();
            }
        }

        check_counters(&nvds);

        let statistics = nvds.statistics().unwrap();
        assert_eq!(statistics.pages.uninitialized, 1);
        // the namespace record and eight counters
        assert_eq!(statistics.entries_overall.used, 9);

        let flash = nvds.deinit();
        assert!(flash.erases() > 5);

        let nvds = Nvds::new(region, flash).unwrap();
        check_counters(&nvds);
    }

    fn check_counters(nvds: &Nvds<&mut common::Flash>) {
        for i in 0..10u32 {
            let expected = match i {
                3 | 7 => Err(Error::NotFound),
                0..=2 => Ok(149 * 100 + i),
                _ => Ok(99 * 100 + i),
            };
            assert_eq!(nvds.get_as::<u32>(Some(&NS), &key(i)), expected);
        }
        assert_eq!(nvds.namespace_index(&NS).unwrap().live_keys, 8);
    }

    #[test]
    fn bulk_value_is_moved_intact() {
        let mut flash = common::Flash::new(3);
        let region = region(&flash);
        let nvds = Nvds::new(region.clone(), &mut flash).unwrap();

        // namespace record, one fragment of eleven entries and the BulkInfo entry
        let blob: Vec<u8> = (0u8..=200).cycle().take(300).collect();
        nvds.put(Some(&NS), &Key::from_str("blob"), &blob).unwrap();

        // the rest of the first page holds overwritten counters
        for round in 0..113u32 {
            nvds.set(Some(&NS), &key(round % 4), round).unwrap();
        }

        // the second page is completely live
        for i in 0..126u32 {
            let fill = Key::try_from_str(&format!("fill{i}")).unwrap();
            nvds.set(Some(&NS), &fill, i).unwrap();
        }

        nvds.set(Some(&NS), &Key::from_str("trigger"), true).unwrap();

        let statistics = nvds.statistics().unwrap();
        assert_eq!(statistics.entries_per_page[0].free, 126);
        assert_eq!(statistics.entries_per_page[1].used, 126);
        assert_eq!(statistics.entries_per_page[2].used, 13 + 4 + 1);

        let check = |nvds: &Nvds<&mut common::Flash>| {
            assert_eq!(
                nvds.get_vec(Some(&NS), &Key::from_str("blob")).unwrap(),
                blob
            );
            for i in 0..4u32 {
                assert_eq!(nvds.get_as::<u32>(Some(&NS), &key(i)), Ok(109 + (i + 3) % 4));
            }
            assert_eq!(nvds.get_as::<bool>(Some(&NS), &Key::from_str("trigger")), Ok(true));
        };
        check(&nvds);

        let flash = nvds.deinit();
        assert_eq!(flash.erases(), 1);

        let nvds = Nvds::new(region, flash).unwrap();
        check(&nvds);
    }

    /// Fragment number and page sequence of every Bulk fragment in a verbose dump.
    fn fragment_sequences(dump: &str) -> Vec<(u32, u32)> {
        let mut sequence = 0;
        let mut found = Vec::new();
        for line in dump.lines() {
            if line.starts_with("  @") {
                sequence = line.split_whitespace().nth(2).unwrap().parse().unwrap();
            } else if let Some((_, fragno)) = line.rsplit_once(" fragment ") {
                found.push((fragno.parse().unwrap(), sequence));
            }
        }
        found.sort();
        found
    }

    #[test]
    fn moved_fragment_is_found_out_of_order() {
        let mut flash = common::Flash::new(3);
        let region = region(&flash);
        let nvds = Nvds::new(region.clone(), &mut flash).unwrap();

        for i in 0..120u32 {
            nvds.set(None, &key(i % 4), i).unwrap();
        }

        // fragment 0 takes the last six slots of the first page, fragment 1 and the
        // BulkInfo entry 91 slots of the second one
        let blob: Vec<u8> = (0u8..=250).cycle().take(3000).collect();
        nvds.put(None, &Key::from_str("blob"), &blob).unwrap();

        let fragments = fragment_sequences(&nvds.dump(true, None).unwrap());
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].1 < fragments[1].1);

        for i in 0..35u32 {
            let fill = Key::try_from_str(&format!("fill{i}")).unwrap();
            nvds.set(None, &fill, i).unwrap();
        }
        nvds.set(None, &Key::from_str("trigger"), 1u8).unwrap();

        // the first page was collected, fragment 0 now sits behind fragment 1
        let statistics = nvds.statistics().unwrap();
        assert_eq!(statistics.entries_per_page[0].free, 126);
        assert_eq!(statistics.entries_per_page[1].used, 126);
        assert_eq!(statistics.entries_per_page[2].used, 4 + 6 + 1);

        let dump = nvds.dump(true, None).unwrap();
        println!("{dump}");
        let fragments = fragment_sequences(&dump);
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].1 > fragments[1].1);

        let check = |nvds: &Nvds<&mut common::Flash>| {
            assert_eq!(nvds.get(None, &Key::from_str("blob"), None), Ok(3000));
            assert_eq!(nvds.get_vec(None, &Key::from_str("blob")).unwrap(), blob);
            for i in 0..4u32 {
                assert_eq!(nvds.get_as::<u32>(None, &key(i)), Ok(116 + i));
            }
        };
        check(&nvds);

        let flash = nvds.deinit();
        let nvds = Nvds::new(region, flash).unwrap();
        check(&nvds);
        assert_eq!(fragment_sequences(&nvds.dump(true, None).unwrap()), fragments);
    }

    #[test]
    fn sparsest_page_is_collected() {
        let mut flash = common::Flash::new(3);
        let nvds = Nvds::new(region(&flash), &mut flash).unwrap();

        // the first page only holds values which are overwritten below
        for i in 0..126u32 {
            nvds.set(None, &key(i % 8), i).unwrap();
        }
        // the second page is full of values which stay
        for i in 100..226u32 {
            nvds.set(None, &key(i), i).unwrap();
        }

        // the second page is only marked full by the next write
        let pages = nvds.statistics().unwrap().pages;
        assert_eq!(pages.full, 1);
        assert_eq!(pages.active, 1);
        assert_eq!(pages.uninitialized, 1);

        nvds.set(None, &Key::from_str("trigger"), 1u8).unwrap();

        // the first page was collected, its eight live values moved to the third page
        let statistics = nvds.statistics().unwrap();
        assert_eq!(statistics.entries_per_page[0].free, 126);
        assert_eq!(statistics.entries_per_page[1].used, 126);
        assert_eq!(statistics.entries_per_page[2].used, 8 + 1);

        for i in 118..126u32 {
            assert_eq!(nvds.get_as::<u32>(None, &key(i % 8)), Ok(i));
        }
        for i in 100..226u32 {
            assert_eq!(nvds.get_as::<u32>(None, &key(i)), Ok(i));
        }
    }

    #[test]
    fn full_region_reports_no_space() {
        let mut flash = common::Flash::new(2);
        let nvds = Nvds::new(region(&flash), &mut flash).unwrap();

        let mut stored = 0u32;
        let result = loop {
            match nvds.set(None, &key(stored), stored) {
                Ok(()) => stored += 1,
                Err(e) => break e,
            }
        };

        assert_eq!(result, Error::NoSpace);
        assert_eq!(stored, 126);
        for i in 0..stored {
            assert_eq!(nvds.get_as::<u32>(None, &key(i)), Ok(i));
        }

        // deleting makes room again
        nvds.delete(None, &key(0)).unwrap();
        nvds.set(None, &key(stored), stored).unwrap();
        assert_eq!(nvds.get_as::<u32>(None, &key(stored)), Ok(stored));
    }
}
