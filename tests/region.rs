mod common;

mod region {
    use crate::common::Flash;
    use gd_nvds::error::Error;
    use gd_nvds::{Key, Nvds, Region, Regions};
    use pretty_assertions::assert_eq;

    #[test]
    fn overlapping_region_is_not_mounted() {
        let mut flash = Flash::new(6);
        // a second driver for the same chip
        let mut other = Flash::new(6);
        let mut regions = Regions::new();

        let one = Region::new(0, 0x3000, "one").unwrap();
        let nvds: Nvds<_> = regions.mount(one, &mut flash, None).unwrap();
        nvds.set(None, &Key::from_str("a"), 1u8).unwrap();

        let overlapping = Region::new(0x1000, 0x3000, "two").unwrap();
        let result: Result<Nvds<_>, _> = regions.mount(overlapping.clone(), &mut other, None);
        assert_eq!(result.err(), Some(Error::InvalidParam));
        assert!(regions.find("two").is_none());

        let same_label = Region::new(0x3000, 0x3000, "one").unwrap();
        let result: Result<Nvds<_>, _> = regions.mount(same_label, &mut other, None);
        assert_eq!(result.err(), Some(Error::InvalidParam));

        // the claim of "one" ends with the unmount
        regions.unmount(nvds).unwrap();
        assert!(regions.find("one").is_none());

        let nvds: Nvds<_> = regions.mount(overlapping, &mut other, None).unwrap();
        assert_eq!(nvds.region().label(), "two");
        assert_eq!(regions.iter().count(), 1);
    }

    #[test]
    fn adjacent_regions_are_independent() {
        let mut flash = Flash::new(4);
        let mut other = Flash::new(4);
        let mut regions = Regions::new();

        let low: Nvds<_> = regions
            .mount(Region::new(0, 0x2000, "low").unwrap(), &mut flash, None)
            .unwrap();
        let high: Nvds<_> = regions
            .mount(Region::new(0x2000, 0x2000, "high").unwrap(), &mut other, None)
            .unwrap();

        low.set(None, &Key::from_str("side"), 1u8).unwrap();
        high.set(None, &Key::from_str("side"), 2u8).unwrap();
        assert_eq!(low.get_as::<u8>(None, &Key::from_str("side")), Ok(1));
        assert_eq!(high.get_as::<u8>(None, &Key::from_str("side")), Ok(2));

        regions.unmount(low).unwrap();
        regions.unmount(high).unwrap();
        assert_eq!(regions.iter().count(), 0);

        // the first region only wrote to its own sectors
        assert!(flash.buf[0x2000..].iter().all(|&it| it == 0xFF));
        assert!(other.buf[..0x2000].iter().all(|&it| it == 0xFF));
    }

    #[test]
    fn failed_mount_releases_the_claim() {
        let mut flash = Flash::new(2);
        let mut regions = Regions::new();

        // the flash ends after two sectors
        let beyond = Region::new(0x1000, 0x2000, "beyond").unwrap();
        let result: Result<Nvds<_>, _> = regions.mount(beyond, &mut flash, None);
        assert_eq!(result.err(), Some(Error::InvalidParam));
        assert!(regions.find("beyond").is_none());

        let fitting = Region::new(0, 0x2000, "beyond").unwrap();
        let nvds: Nvds<_> = regions.mount(fitting, &mut flash, None).unwrap();
        assert_eq!(regions.unmount(nvds).map(|flash| flash.len()), Ok(0x2000));
    }

    #[test]
    fn region_past_the_end_of_flash() {
        let mut flash = Flash::new(3);

        let result = Nvds::new(Region::new(0x2000, 0x2000, "test").unwrap(), &mut flash);
        assert_eq!(result.err(), Some(Error::InvalidParam));
        // nothing was read
        assert!(flash.operations.is_empty());

        let nvds = Nvds::new(Region::new(0x1000, 0x2000, "test").unwrap(), &mut flash).unwrap();
        nvds.set(None, &Key::from_str("a"), 1u8).unwrap();
        assert_eq!(nvds.get_as::<u8>(None, &Key::from_str("a")), Ok(1));
    }
}
