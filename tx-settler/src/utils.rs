pub mod key_wallet;
