//! Minimal HID report descriptor scan.
//!
//! Only what interface selection needs: which report ids carry Feature
//! main items. Item layout per HID 1.11 section 6.2.2:
//!
//! ```text
//! prefix = tag(4) | type(2) | size(2)     size 3 means 4 data bytes
//! 0xFE   = long item: [FE][len][tag][data ...]
//! ```

const ITEM_TYPE_MAIN: u8 = 0;
const ITEM_TYPE_GLOBAL: u8 = 1;

const MAIN_TAG_FEATURE: u8 = 0x0B;
const GLOBAL_TAG_REPORT_ID: u8 = 0x08;
const GLOBAL_TAG_PUSH: u8 = 0x0A;
const GLOBAL_TAG_POP: u8 = 0x0B;

const LONG_ITEM_PREFIX: u8 = 0xFE;

/// Report ids used by Feature items, in descriptor order, without repeats.
///
/// Feature items that appear before any Report ID item are reported as
/// id 0. A truncated trailing item ends the scan.
pub fn feature_report_ids(descriptor: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut report_id = 0u8;
    let mut stack = Vec::new();
    let mut pos = 0;

    while pos < descriptor.len() {
        let prefix = descriptor[pos];

        if prefix == LONG_ITEM_PREFIX {
            let Some(&len) = descriptor.get(pos + 1) else {
                break;
            };
            pos += 3 + len as usize;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let item_type = (prefix >> 2) & 0x03;
        let tag = prefix >> 4;

        let Some(data) = descriptor.get(pos + 1..pos + 1 + size) else {
            break;
        };

        match (item_type, tag) {
            (ITEM_TYPE_GLOBAL, GLOBAL_TAG_REPORT_ID) => {
                report_id = data.first().copied().unwrap_or(0);
            }
            (ITEM_TYPE_GLOBAL, GLOBAL_TAG_PUSH) => stack.push(report_id),
            (ITEM_TYPE_GLOBAL, GLOBAL_TAG_POP) => {
                report_id = stack.pop().unwrap_or(report_id);
            }
            (ITEM_TYPE_MAIN, MAIN_TAG_FEATURE) => {
                if !ids.contains(&report_id) {
                    ids.push(report_id);
                }
            }
            _ => {}
        }

        pos += 1 + size;
    }

    ids
}

/// Whether the descriptor declares a Feature report with `report_id`.
pub fn declares_feature_report(descriptor: &[u8], report_id: u8) -> bool {
    feature_report_ids(descriptor).contains(&report_id)
}
