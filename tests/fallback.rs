mod common;

mod fallback {
    use crate::common::{self, LAYOUT};
    use hse_boot::boot_log::BootStatus;
    use hse_boot::context::Context;
    use hse_boot::error::{EngineError, Error};
    use hse_boot::fallback::FallbackMetadata;
    use hse_boot::platform::StatusPattern;
    use pretty_assertions::assert_eq;

    const IMAGE_LEN: usize = 0x8000 + 123;

    fn setup() -> (common::Flash, common::Engine, common::Board) {
        let image = common::image(IMAGE_LEN, 9);
        let flash = common::Flash::with_firmware(&image, &[0x51; 64]);
        (flash, common::Engine::default(), common::Board::default())
    }

    fn store_fallback(flash: &mut common::Flash) -> FallbackMetadata {
        let mut engine = common::Engine::default();
        let mut board = common::Board::default();
        let mut ctx = Context::new(flash, &mut engine, &mut board, common::config()).unwrap();
        ctx.fallback().store_current_firmware(common::V1).unwrap()
    }

    #[test]
    fn stored_fallback_is_valid() {
        let (mut flash, mut engine, mut board) = setup();
        let metadata = store_fallback(&mut flash);

        let primary = common::primary_region(&common::image(IMAGE_LEN, 9));
        assert_eq!(metadata.firmware_size, LAYOUT.primary.size);
        assert_eq!(metadata.firmware_crc, common::crc32(&primary));
        assert_eq!(metadata.update_count, 0);
        assert_eq!(metadata.firmware_version, common::V1);

        assert_eq!(
            flash.slice(LAYOUT.fallback_image.offset, primary.len()),
            &primary[..]
        );
        assert_eq!(flash.slice(LAYOUT.fallback_signature.offset, 64), &[0x51; 64]);

        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        let mut fallback = ctx.fallback();
        assert!(fallback.is_valid());
        assert_eq!(fallback.init(), Ok(()));
        assert_eq!(fallback.metadata().unwrap(), Some(metadata));
        assert_eq!(fallback.verify_signature(), Ok(()));
        drop(ctx);

        let request = engine.requests.last().unwrap();
        assert_eq!(
            request.data_address,
            common::XIP_BASE + LAYOUT.fallback_image.offset
        );
        assert_eq!(
            request.signature_address,
            common::XIP_BASE + LAYOUT.fallback_signature.offset
        );
    }

    #[test]
    fn blank_fallback_is_invalid_but_not_an_error() {
        let (mut flash, mut engine, mut board) = setup();
        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        let mut fallback = ctx.fallback();

        assert_eq!(fallback.init(), Ok(()));
        assert!(!fallback.is_valid());
        assert_eq!(fallback.verify_integrity(), Err(Error::InvalidRecord));
    }

    #[test]
    fn flipped_image_byte_invalidates_fallback() {
        let (mut flash, mut engine, mut board) = setup();
        store_fallback(&mut flash);
        flash.buf[LAYOUT.fallback_image.offset as usize + 0x1234] ^= 0x01;

        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        let mut fallback = ctx.fallback();
        assert!(!fallback.is_valid());
        assert_eq!(fallback.verify_integrity(), Err(Error::CrcMismatch));
        // the metadata itself is still intact
        assert_eq!(fallback.init(), Ok(()));
    }

    #[test]
    fn flipped_metadata_byte_invalidates_fallback() {
        let (mut flash, mut engine, mut board) = setup();
        store_fallback(&mut flash);
        flash.buf[LAYOUT.fallback_metadata as usize + 9] ^= 0x80;

        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        let mut fallback = ctx.fallback();
        assert!(!fallback.is_valid());
        assert_eq!(fallback.verify_integrity(), Err(Error::InvalidRecord));
        assert_eq!(fallback.init(), Err(Error::InvalidRecord));
    }

    #[test]
    fn recovery_restores_primary() {
        let (mut flash, mut engine, mut board) = setup();
        let stored = store_fallback(&mut flash);
        let expected = flash.slice(LAYOUT.primary.offset, LAYOUT.primary.size as usize).to_vec();

        // corrupt primary image and signature
        flash.buf[LAYOUT.primary.offset as usize + 0x100] ^= 0xFF;
        flash.buf[LAYOUT.primary_signature.offset as usize] = 0x00;

        {
            let mut ctx =
                Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
            ctx.fallback().recover_main_firmware().unwrap();

            let metadata = ctx.fallback().metadata().unwrap().unwrap();
            assert_eq!(metadata.update_count, stored.update_count + 1);
            assert_eq!(metadata.firmware_crc, stored.firmware_crc);
            assert_eq!(
                ctx.recovery.entries().last().and_then(|e| e.boot_status()),
                Some(BootStatus::RecoveryActive)
            );
        }

        assert_eq!(
            flash.slice(LAYOUT.primary.offset, LAYOUT.primary.size as usize),
            &expected[..]
        );
        assert_eq!(flash.slice(LAYOUT.primary_signature.offset, 64), &[0x51; 64]);
        assert_eq!(board.patterns, vec![StatusPattern::Recovery]);
    }

    #[test]
    fn recovery_without_fallback_leaves_primary_alone() {
        let (mut flash, mut engine, mut board) = setup();
        flash.operations.clear();
        {
            let mut ctx =
                Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
            assert_eq!(
                ctx.fallback().recover_main_firmware(),
                Err(Error::FallbackInvalid)
            );
        }
        assert_eq!(
            flash.modifications(LAYOUT.primary.offset..LAYOUT.primary_signature.end() as u32),
            0
        );
    }

    #[test]
    fn recovery_reports_flash_errors() {
        let (mut flash, mut engine, mut board) = setup();
        store_fallback(&mut flash);
        flash.faulty = Some(LAYOUT.primary.offset..LAYOUT.primary.offset + 0x1000);

        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        assert_eq!(
            ctx.fallback().recover_main_firmware(),
            Err(Error::FlashError)
        );
        assert_eq!(ctx.fallback().metadata().unwrap().unwrap().update_count, 0);
    }

    #[test]
    fn jump_uses_fallback_vector_table() {
        let (mut flash, mut engine, mut board) = setup();
        store_fallback(&mut flash);

        let exit = {
            let mut ctx =
                Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
            common::run(|| ctx.fallback().jump_to_fallback_firmware())
        };

        assert_eq!(
            exit,
            Err(common::Exit::Jump {
                entry: common::XIP_BASE + 0x401,
                stack_pointer: 0x2000_8000,
            })
        );
        assert_eq!(
            board.vector_table,
            Some(common::XIP_BASE + LAYOUT.fallback_image.offset)
        );
    }

    #[test]
    fn jump_without_fallback_returns() {
        let (mut flash, mut engine, mut board) = setup();
        {
            let mut ctx =
                Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
            assert_eq!(
                common::run(|| ctx.fallback().jump_to_fallback_firmware()),
                Ok(())
            );
        }
        assert_eq!(board.vector_table, None);
    }

    #[test]
    fn rejected_fallback_signature_is_reported() {
        let (mut flash, mut engine, mut board) = setup();
        store_fallback(&mut flash);
        engine.reject_fallback(EngineError::AuthFailed);

        let mut ctx = Context::new(&mut flash, &mut engine, &mut board, common::config()).unwrap();
        assert_eq!(
            ctx.fallback().verify_signature(),
            Err(EngineError::AuthFailed)
        );
        assert_eq!(ctx.last_engine_error(), Some(EngineError::AuthFailed));
    }
}
